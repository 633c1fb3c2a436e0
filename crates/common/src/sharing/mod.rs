//! Envelope scheme for sharing records with peers
//!
//! A record is encrypted exactly once under a fresh random key and stored
//! under a random identifier. Each recipient then receives a small wrapped
//! blob holding `identifier || key`, sealed under the outbound direction of
//! the recipient's [`KeySet`] and stored under an identifier the recipient
//! can derive on its own.

mod records;
pub mod workflow;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{
    CryptoError, Identifier, KeySet, KeySetError, RevocationToken, Secret, TokenPair,
    IDENTIFIER_SIZE, SECRET_SIZE,
};

pub use records::{
    FriendRef, Granularity, LocationTrack, Position, Record, RecordKind, Shareable, StepCount,
    StepInterval, TrackMode,
};
pub use workflow::{
    fetch_shared, revoke_record, share_record, FetchReport, RevokeReport, ShareReport,
    WorkflowError,
};

/// Size of the plaintext sealed for a recipient: `identifier || key`
pub const WRAPPED_PLAINTEXT_SIZE: usize = IDENTIFIER_SIZE + SECRET_SIZE;

/// Handle of a data block in the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One encrypted record plus the bookkeeping needed to find, open and
/// revoke it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub key: Secret,
    /// Absent until fetched from the server
    pub ciphertext: Option<Vec<u8>>,
    pub identifier: Identifier,
    /// Known only to the uploader; a received block does not learn it
    pub granularity: Option<Granularity>,
    pub owner: Option<FriendRef>,
    /// Only the uploader holds this
    pub revocation_token: Option<RevocationToken>,
    pub local_id: Option<LocalId>,
}

/// Why a record could not be opened. Only ever logged, never shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    MissingCiphertext,
    Authentication,
    Parse,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            UnavailableReason::MissingCiphertext => "missing ciphertext",
            UnavailableReason::Authentication => "authentication",
            UnavailableReason::Parse => "parse",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SharingError {
    #[error("record unavailable or corrupted")]
    Unavailable(UnavailableReason),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    KeySet(#[from] KeySetError),
}

/// Serialize `shareable` at `granularity` and encrypt it under a fresh key,
/// bound to `tokens`' identifier.
pub fn encrypt_shareable(
    shareable: &dyn Shareable,
    granularity: Granularity,
    tokens: &TokenPair,
) -> Result<DataBlock, SharingError> {
    let plaintext = shareable.to_bytes(granularity)?;
    let key = Secret::generate();
    let identifier = *tokens.identifier();
    let ciphertext = key.encrypt(&plaintext, identifier.as_bytes())?;

    Ok(DataBlock {
        key,
        ciphertext: Some(ciphertext),
        identifier,
        granularity: Some(granularity),
        owner: shareable.owner().copied(),
        revocation_token: Some(tokens.revocation_token().clone()),
        local_id: None,
    })
}

/// Seal `identifier || key` of `block` for the peer behind `keyset`.
///
/// The nonce is the current outbound counter. The caller must advance the
/// counter with [`crate::crypto::notify_outbound_identifier_used`] and
/// persist the successor before sending the result.
pub fn encrypt_keys_and_identifier(
    block: &DataBlock,
    keyset: &KeySet,
) -> Result<Vec<u8>, SharingError> {
    let mut plaintext = [0u8; WRAPPED_PLAINTEXT_SIZE];
    plaintext[..IDENTIFIER_SIZE].copy_from_slice(block.identifier.as_bytes());
    plaintext[IDENTIFIER_SIZE..].copy_from_slice(block.key.bytes());
    let sealed = keyset.seal_with_outbound_counter(&plaintext);
    zeroize::Zeroize::zeroize(&mut plaintext);
    Ok(sealed?)
}

/// Open a blob produced by [`encrypt_keys_and_identifier`] on the other
/// side of the exchange. The returned block carries no ciphertext.
pub fn decrypt_keys_and_identifier(
    data: &[u8],
    keyset: &KeySet,
) -> Result<DataBlock, SharingError> {
    let plaintext = zeroize::Zeroizing::new(keyset.open_with_inbound_counter(data)?);
    if plaintext.len() != WRAPPED_PLAINTEXT_SIZE {
        return Err(CryptoError::MalformedInput("wrapped key has wrong size").into());
    }

    let identifier = Identifier::try_from(&plaintext[..IDENTIFIER_SIZE])?;
    let key = Secret::from_slice(&plaintext[IDENTIFIER_SIZE..])?;

    Ok(DataBlock {
        key,
        ciphertext: None,
        identifier,
        granularity: None,
        owner: None,
        revocation_token: None,
        local_id: None,
    })
}

/// Decrypt and decode the record held in `block`.
///
/// Every failure is reported as [`SharingError::Unavailable`]; nothing of a
/// record that fails to authenticate is returned.
pub fn decrypt_shareable(block: &DataBlock) -> Result<Record, SharingError> {
    let ciphertext = block
        .ciphertext
        .as_deref()
        .ok_or(SharingError::Unavailable(UnavailableReason::MissingCiphertext))?;

    let plaintext = block
        .key
        .decrypt(ciphertext, block.identifier.as_bytes())
        .map_err(|_| SharingError::Unavailable(UnavailableReason::Authentication))?;

    let mut record = Record::from_bytes(&plaintext).map_err(|e| {
        tracing::debug!("authenticated record failed to decode: {}", e);
        SharingError::Unavailable(UnavailableReason::Parse)
    })?;
    record.set_owner(block.owner);
    Ok(record)
}
