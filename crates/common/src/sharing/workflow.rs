//! Share, fetch and revoke records against a live connection
//!
//! Counter discipline: every outbound counter value is reserved (and its
//! successor persisted) before anything touches the network. A value whose
//! upload is rejected or never happens is wasted, and [`fetch_shared`] steps
//! over it on the receiving side. The futures here can be spawned on a
//! tokio task; dropping one mid-flight rolls nothing back.

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    decrypt_keys_and_identifier, decrypt_shareable, encrypt_keys_and_identifier,
    encrypt_shareable, DataBlock, FriendRef, Granularity, LocalId, Record, SharingError,
};
use crate::crypto::{
    generate_inbound_identifier, generate_random_identifier, notify_inbound_identifier_used,
    KeySet, TokenPair,
};
use crate::membership::MembershipFilter;
use crate::protocol::{Connection, DelResult, GetResult, ProtocolError, PutResult};
use crate::store::{OutboundAllocation, Recipient, ShareStore, ShareStoreError};

/// Upper bound on inbound counter values consumed from one peer per fetch
pub const MAX_FETCH_PER_CALL: usize = 256;

/// Inbound counter values looked up past the last one consumed
pub const FETCH_LOOKAHEAD: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError<E> {
    #[error(transparent)]
    Sharing(#[from] SharingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("share store error: {0}")]
    Store(#[from] ShareStoreError<E>),
    /// Only the uploader holds the revocation tokens
    #[error("data block {0} was not uploaded by us")]
    NotOwner(LocalId),
}

/// Outcome of [`share_record`]
#[derive(Debug, Clone)]
pub struct ShareReport {
    /// Set once the record itself was stored and committed locally
    pub local_id: Option<LocalId>,
    pub record: PutResult,
    pub recipients: Vec<(FriendRef, PutResult)>,
}

impl ShareReport {
    pub fn delivered_to(&self) -> impl Iterator<Item = &FriendRef> {
        self.recipients
            .iter()
            .filter(|(_, result)| *result == PutResult::Ok)
            .map(|(peer, _)| peer)
    }
}

/// Outcome of [`fetch_shared`]
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub records: Vec<(LocalId, Record)>,
    /// Blobs that could not be opened or whose record is gone
    pub unavailable: usize,
}

/// Outcome of [`revoke_record`]
#[derive(Debug, Clone)]
pub struct RevokeReport {
    pub record: DelResult,
    pub recipients: Vec<(FriendRef, DelResult)>,
    /// Whether the local block was dropped
    pub removed: bool,
}

fn gone(result: &DelResult) -> bool {
    matches!(result, DelResult::Ok | DelResult::NotTaken)
}

/// Encrypt `record` once and share it with every peer in `recipients`
/// using a single batched upload.
///
/// Only recipients whose wrapped key the server acknowledged are recorded
/// locally. If the record itself is rejected the recipient blobs already
/// stored are deleted again, best effort.
pub async fn share_record<S, F, St>(
    conn: &mut Connection<S, F>,
    store: &St,
    record: &Record,
    granularity: Granularity,
    recipients: &[FriendRef],
) -> Result<ShareReport, WorkflowError<St::Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: MembershipFilter,
    St: ShareStore,
{
    let tokens = generate_random_identifier();
    let block = encrypt_shareable(record, granularity, &tokens)?;
    let record_key = block.identifier.to_hex();
    let ciphertext = block
        .ciphertext
        .clone()
        .ok_or(SharingError::Unavailable(super::UnavailableReason::MissingCiphertext))?;

    let mut entries = BTreeMap::new();
    let mut allocations: Vec<OutboundAllocation> = Vec::with_capacity(recipients.len());
    for peer in recipients {
        let allocation = store.allocate_outbound(*peer).await?;
        let wrapped = encrypt_keys_and_identifier(&block, &allocation.keyset)?;
        entries.insert(allocation.tokens.identifier().to_hex(), wrapped);
        allocations.push(allocation);
    }
    entries.insert(record_key.clone(), ciphertext);

    tracing::debug!(
        "share_record: uploading record and {} wrapped keys",
        allocations.len()
    );
    let results = conn.put_many(entries).await?;
    let result_for = |key: &str| results.get(key).copied().unwrap_or(PutResult::ProtocolError);

    let record_result = result_for(&record_key);
    let recipient_results: Vec<(FriendRef, PutResult)> = allocations
        .iter()
        .map(|a| (a.peer, result_for(&a.tokens.identifier().to_hex())))
        .collect();

    if record_result != PutResult::Ok {
        tracing::warn!("share_record: record upload rejected ({:?})", record_result);
        let orphans: BTreeMap<String, Vec<u8>> = allocations
            .iter()
            .filter(|a| result_for(&a.tokens.identifier().to_hex()) == PutResult::Ok)
            .map(|a| {
                (
                    a.tokens.identifier().to_hex(),
                    a.tokens.revocation_token().as_bytes().to_vec(),
                )
            })
            .collect();
        if !orphans.is_empty() {
            if let Err(e) = conn.del_many(orphans).await {
                tracing::warn!("share_record: failed to clean up wrapped keys: {}", e);
            }
        }
        return Ok(ShareReport {
            local_id: None,
            record: record_result,
            recipients: recipient_results,
        });
    }

    let local_id = store.add_data_block(block).await?;
    for allocation in allocations {
        if result_for(&allocation.tokens.identifier().to_hex()) != PutResult::Ok {
            tracing::warn!("share_record: wrapped key for {} rejected", allocation.peer);
            continue;
        }
        store
            .add_recipient(
                local_id,
                Recipient {
                    peer: allocation.peer,
                    tokens: allocation.tokens,
                },
            )
            .await?;
    }

    tracing::info!(
        "shared record {} with {}/{} recipients",
        local_id,
        recipient_results
            .iter()
            .filter(|(_, r)| *r == PutResult::Ok)
            .count(),
        recipient_results.len()
    );
    Ok(ShareReport {
        local_id: Some(local_id),
        record: record_result,
        recipients: recipient_results,
    })
}

/// Collect every record `peer` has shared with us since the last fetch
///
/// Inbound identifiers are looked up in windows of [`FETCH_LOOKAHEAD`]
/// counter values, so counter values the sender spent without storing
/// anything are stepped over. `ctr_in` only moves once the records of a
/// window are fetched and stored locally; a failure before that leaves the
/// key set untouched and the next fetch sees the same blobs again.
pub async fn fetch_shared<S, F, St>(
    conn: &mut Connection<S, F>,
    store: &St,
    peer: FriendRef,
) -> Result<FetchReport, WorkflowError<St::Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: MembershipFilter,
    St: ShareStore,
{
    let mut report = FetchReport::default();
    let mut consumed = 0;

    while consumed < MAX_FETCH_PER_CALL {
        let start = store.keyset(peer).await?;
        let window = inbound_window(&start, FETCH_LOOKAHEAD.min(MAX_FETCH_PER_CALL - consumed));
        let keys: Vec<String> = window
            .iter()
            .map(|(_, tokens)| tokens.identifier().to_hex())
            .collect();
        let found = conn.get_many(&keys).await?;
        let stored = |key: &String| matches!(found.get(key), Some(GetResult::Found(_)));

        // everything up to the last stored blob is consumed, holes included
        let Some(last) = keys.iter().rposition(stored) else {
            break;
        };
        let skipped = keys[..=last].iter().filter(|key| !stored(*key)).count();
        if skipped > 0 {
            tracing::debug!(
                "fetch_shared: stepping over {} unused identifiers from {}",
                skipped,
                peer
            );
        }

        let mut unavailable = 0;
        let mut blocks: Vec<DataBlock> = Vec::new();
        for ((keyset, _), key) in window[..=last].iter().zip(&keys) {
            let Some(GetResult::Found(wrapped)) = found.get(key) else {
                continue;
            };
            match decrypt_keys_and_identifier(wrapped, keyset) {
                Ok(mut block) => {
                    block.owner = Some(peer);
                    blocks.push(block);
                }
                Err(e) => {
                    tracing::warn!("fetch_shared: wrapped key from {} unusable: {}", peer, e);
                    unavailable += 1;
                }
            }
        }

        let record_keys: Vec<String> = blocks.iter().map(|b| b.identifier.to_hex()).collect();
        let records = if record_keys.is_empty() {
            BTreeMap::new()
        } else {
            conn.get_many(&record_keys).await?
        };

        let mut added = Vec::with_capacity(blocks.len());
        for (mut block, key) in blocks.into_iter().zip(&record_keys) {
            match records.get(key) {
                Some(GetResult::Found(ciphertext)) => block.ciphertext = Some(ciphertext.clone()),
                _ => {
                    tracing::debug!("fetch_shared: record from {} no longer stored", peer);
                    unavailable += 1;
                    continue;
                }
            }
            match decrypt_shareable(&block) {
                Ok(record) => {
                    let local_id = store.add_data_block(block).await?;
                    added.push((local_id, record));
                }
                Err(e) => {
                    tracing::warn!("fetch_shared: record from {}: {}", peer, e);
                    unavailable += 1;
                }
            }
        }

        let next = notify_inbound_identifier_used(window[last].0.clone())
            .map_err(|e| ShareStoreError::<St::Error>::KeySet(peer, e))?;
        match store.update_keyset(peer, &start, next).await {
            Ok(()) => {
                report.records.extend(added);
                report.unavailable += unavailable;
                consumed += last + 1;
            }
            Err(e) => {
                // someone else moved ctr_in; drop our copies of what they took
                for (local_id, _) in added {
                    store.remove_data_block(local_id).await?;
                }
                match e {
                    ShareStoreError::StaleKeySet(_) => continue,
                    e => return Err(e.into()),
                }
            }
        }
    }

    tracing::info!(
        "fetched {} records from {} ({} unavailable)",
        report.records.len(),
        peer,
        report.unavailable
    );
    Ok(report)
}

/// `(key set, identifier)` for the next `len` inbound counter values,
/// stopping early if the counter runs out
fn inbound_window(start: &KeySet, len: usize) -> Vec<(KeySet, TokenPair)> {
    let mut window = Vec::with_capacity(len);
    let mut keyset = start.clone();
    for _ in 0..len {
        let tokens = generate_inbound_identifier(&keyset);
        let next = notify_inbound_identifier_used(keyset.clone());
        window.push((keyset, tokens));
        match next {
            Ok(next) => keyset = next,
            Err(_) => break,
        }
    }
    window
}

/// Delete a record we uploaded, and every wrapped key pointing at it
///
/// The local block is dropped once nothing of it is left on the server.
pub async fn revoke_record<S, F, St>(
    conn: &mut Connection<S, F>,
    store: &St,
    local_id: LocalId,
) -> Result<RevokeReport, WorkflowError<St::Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: MembershipFilter,
    St: ShareStore,
{
    let block = store.data_block(local_id).await?;
    let token = block
        .revocation_token
        .as_ref()
        .ok_or(WorkflowError::NotOwner(local_id))?;
    let recipients = store.recipients(local_id).await?;

    let record_key = block.identifier.to_hex();
    let mut entries = BTreeMap::new();
    entries.insert(record_key.clone(), token.as_bytes().to_vec());
    for recipient in &recipients {
        entries.insert(
            recipient.tokens.identifier().to_hex(),
            recipient.tokens.revocation_token().as_bytes().to_vec(),
        );
    }

    let results = conn.del_many(entries).await?;
    let result_for = |key: &str| results.get(key).copied().unwrap_or(DelResult::ProtocolError);

    let record = result_for(&record_key);
    let recipient_results: Vec<(FriendRef, DelResult)> = recipients
        .iter()
        .map(|r| (r.peer, result_for(&r.tokens.identifier().to_hex())))
        .collect();

    let removed = gone(&record) && recipient_results.iter().all(|(_, r)| gone(r));
    if removed {
        store.remove_data_block(local_id).await?;
        tracing::info!("revoked record {}", local_id);
    } else {
        tracing::warn!("revoke of record {} incomplete, keeping local copy", local_id);
    }

    Ok(RevokeReport {
        record,
        recipients: recipient_results,
        removed,
    })
}
