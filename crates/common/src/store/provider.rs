use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    generate_outbound_identifier, notify_outbound_identifier_used, KeySet, KeySetError,
    RevocationToken, TokenPair,
};
use crate::sharing::{DataBlock, FriendRef, LocalId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShareStoreError<T> {
    #[error("unhandled share store provider error: {0}")]
    Provider(#[from] T),
    #[error("unknown peer {0}")]
    UnknownPeer(FriendRef),
    #[error("peer {0} already has a key set")]
    PeerExists(FriendRef),
    /// The key set changed between read and update
    #[error("stale key set for peer {0}")]
    StaleKeySet(FriendRef),
    #[error("data block {0} not found")]
    BlockNotFound(LocalId),
    #[error("key set for peer {0} exhausted: {1}")]
    KeySet(FriendRef, KeySetError),
}

/// A peer a data block was shared with, and where its wrapped key lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub peer: FriendRef,
    pub tokens: TokenPair,
}

/// An outbound counter value reserved for one upload.
///
/// `keyset` is the predecessor whose `ctr_out` is the nonce for this upload;
/// the store already holds its successor.
#[derive(Debug, Clone)]
pub struct OutboundAllocation {
    pub peer: FriendRef,
    pub keyset: KeySet,
    pub tokens: TokenPair,
}

#[async_trait]
pub trait ShareStore: Send + Sync + Debug + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Register the key set agreed with a new peer
    async fn add_peer(&self, peer: FriendRef, keyset: KeySet)
        -> Result<(), ShareStoreError<Self::Error>>;

    async fn keyset(&self, peer: FriendRef) -> Result<KeySet, ShareStoreError<Self::Error>>;

    /// Replace the key set of `peer` with `next`, only if the stored one is
    /// still `expected`
    ///
    /// # Returns
    /// * `Err(ShareStoreError::StaleKeySet)` - someone else updated it first
    async fn update_keyset(
        &self,
        peer: FriendRef,
        expected: &KeySet,
        next: KeySet,
    ) -> Result<(), ShareStoreError<Self::Error>>;

    /// Forget a peer and its key set
    async fn remove_peer(&self, peer: FriendRef) -> Result<(), ShareStoreError<Self::Error>>;

    async fn peers(&self) -> Result<Vec<FriendRef>, ShareStoreError<Self::Error>>;

    /// Persist a data block, assigning it a fresh local id
    async fn add_data_block(&self, block: DataBlock)
        -> Result<LocalId, ShareStoreError<Self::Error>>;

    async fn data_block(&self, id: LocalId) -> Result<DataBlock, ShareStoreError<Self::Error>>;

    async fn remove_data_block(&self, id: LocalId) -> Result<(), ShareStoreError<Self::Error>>;

    async fn add_recipient(
        &self,
        id: LocalId,
        recipient: Recipient,
    ) -> Result<(), ShareStoreError<Self::Error>>;

    async fn recipients(&self, id: LocalId)
        -> Result<Vec<Recipient>, ShareStoreError<Self::Error>>;

    async fn data_block_by_revocation_token(
        &self,
        token: &RevocationToken,
    ) -> Result<Option<DataBlock>, ShareStoreError<Self::Error>>;

    /// Reserve the next outbound counter value of `peer`.
    ///
    /// The successor key set is persisted before this returns, so the
    /// reserved value is spent even if the upload never happens.
    async fn allocate_outbound(
        &self,
        peer: FriendRef,
    ) -> Result<OutboundAllocation, ShareStoreError<Self::Error>> {
        loop {
            let current = self.keyset(peer).await?;
            let tokens = generate_outbound_identifier(&current);
            let next = notify_outbound_identifier_used(current.clone())
                .map_err(|e| ShareStoreError::<Self::Error>::KeySet(peer, e))?;

            match self.update_keyset(peer, &current, next).await {
                Ok(()) => {
                    return Ok(OutboundAllocation {
                        peer,
                        keyset: current,
                        tokens,
                    })
                }
                Err(ShareStoreError::StaleKeySet(_)) => {
                    tracing::debug!("lost key set race for peer {}, retrying", peer);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
