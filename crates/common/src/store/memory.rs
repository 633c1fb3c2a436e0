use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::provider::{Recipient, ShareStore, ShareStoreError};
use crate::crypto::{KeySet, RevocationToken};
use crate::sharing::{DataBlock, FriendRef, LocalId};

/// In-memory share store using HashMaps
#[derive(Debug, Clone)]
pub struct MemoryShareStore {
    inner: Arc<RwLock<MemoryShareStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryShareStoreInner {
    keysets: HashMap<FriendRef, KeySet>,
    blocks: HashMap<LocalId, DataBlock>,
    recipients: HashMap<LocalId, Vec<Recipient>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryShareStoreError {
    #[error("memory store error: {0}")]
    Internal(String),
}

impl MemoryShareStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryShareStoreInner::default())),
        }
    }

    fn read(
        &self,
    ) -> Result<
        std::sync::RwLockReadGuard<'_, MemoryShareStoreInner>,
        ShareStoreError<MemoryShareStoreError>,
    > {
        self.inner.read().map_err(|e| {
            ShareStoreError::Provider(MemoryShareStoreError::Internal(format!(
                "failed to acquire read lock: {}",
                e
            )))
        })
    }

    fn write(
        &self,
    ) -> Result<
        std::sync::RwLockWriteGuard<'_, MemoryShareStoreInner>,
        ShareStoreError<MemoryShareStoreError>,
    > {
        self.inner.write().map_err(|e| {
            ShareStoreError::Provider(MemoryShareStoreError::Internal(format!(
                "failed to acquire write lock: {}",
                e
            )))
        })
    }
}

impl Default for MemoryShareStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShareStore for MemoryShareStore {
    type Error = MemoryShareStoreError;

    async fn add_peer(
        &self,
        peer: FriendRef,
        keyset: KeySet,
    ) -> Result<(), ShareStoreError<Self::Error>> {
        let mut inner = self.write()?;
        if inner.keysets.contains_key(&peer) {
            return Err(ShareStoreError::PeerExists(peer));
        }
        inner.keysets.insert(peer, keyset);
        Ok(())
    }

    async fn keyset(&self, peer: FriendRef) -> Result<KeySet, ShareStoreError<Self::Error>> {
        self.read()?
            .keysets
            .get(&peer)
            .cloned()
            .ok_or(ShareStoreError::UnknownPeer(peer))
    }

    async fn update_keyset(
        &self,
        peer: FriendRef,
        expected: &KeySet,
        next: KeySet,
    ) -> Result<(), ShareStoreError<Self::Error>> {
        let mut inner = self.write()?;
        let current = inner
            .keysets
            .get_mut(&peer)
            .ok_or(ShareStoreError::UnknownPeer(peer))?;
        if current != expected {
            return Err(ShareStoreError::StaleKeySet(peer));
        }
        *current = next;
        Ok(())
    }

    async fn remove_peer(&self, peer: FriendRef) -> Result<(), ShareStoreError<Self::Error>> {
        self.write()?
            .keysets
            .remove(&peer)
            .map(|_| ())
            .ok_or(ShareStoreError::UnknownPeer(peer))
    }

    async fn peers(&self) -> Result<Vec<FriendRef>, ShareStoreError<Self::Error>> {
        let mut peers: Vec<FriendRef> = self.read()?.keysets.keys().copied().collect();
        peers.sort();
        Ok(peers)
    }

    async fn add_data_block(
        &self,
        mut block: DataBlock,
    ) -> Result<LocalId, ShareStoreError<Self::Error>> {
        let id = LocalId::new();
        block.local_id = Some(id);
        self.write()?.blocks.insert(id, block);
        Ok(id)
    }

    async fn data_block(&self, id: LocalId) -> Result<DataBlock, ShareStoreError<Self::Error>> {
        self.read()?
            .blocks
            .get(&id)
            .cloned()
            .ok_or(ShareStoreError::BlockNotFound(id))
    }

    async fn remove_data_block(&self, id: LocalId) -> Result<(), ShareStoreError<Self::Error>> {
        let mut inner = self.write()?;
        inner.recipients.remove(&id);
        inner
            .blocks
            .remove(&id)
            .map(|_| ())
            .ok_or(ShareStoreError::BlockNotFound(id))
    }

    async fn add_recipient(
        &self,
        id: LocalId,
        recipient: Recipient,
    ) -> Result<(), ShareStoreError<Self::Error>> {
        let mut inner = self.write()?;
        if !inner.blocks.contains_key(&id) {
            return Err(ShareStoreError::BlockNotFound(id));
        }
        inner.recipients.entry(id).or_default().push(recipient);
        Ok(())
    }

    async fn recipients(
        &self,
        id: LocalId,
    ) -> Result<Vec<Recipient>, ShareStoreError<Self::Error>> {
        let inner = self.read()?;
        if !inner.blocks.contains_key(&id) {
            return Err(ShareStoreError::BlockNotFound(id));
        }
        Ok(inner.recipients.get(&id).cloned().unwrap_or_default())
    }

    async fn data_block_by_revocation_token(
        &self,
        token: &RevocationToken,
    ) -> Result<Option<DataBlock>, ShareStoreError<Self::Error>> {
        Ok(self
            .read()?
            .blocks
            .values()
            .find(|block| block.revocation_token.as_ref() == Some(token))
            .cloned())
    }
}
