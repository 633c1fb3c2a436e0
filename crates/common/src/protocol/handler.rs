use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use super::framing::{read_frame, write_frame};
use super::messages::{DelResult, GetResult, Message, PutResult, Reply};
use super::snapshot::compress_snapshot;
use super::{validate_key, ProtocolError};
use crate::membership::MembershipFilter;

/// Server side of the protocol: an in-memory key-value map plus the
/// membership filter handed to clients on connect
#[derive(Debug)]
pub struct KvHandler<F> {
    inner: Arc<RwLock<KvHandlerInner<F>>>,
    protocol_version: String,
}

impl<F> Clone for KvHandler<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            protocol_version: self.protocol_version.clone(),
        }
    }
}

#[derive(Debug)]
struct KvHandlerInner<F> {
    entries: HashMap<String, Vec<u8>>,
    filter: F,
    /// Compressed filter, dropped whenever the filter changes
    snapshot: Option<Vec<u8>>,
}

impl<F: MembershipFilter> KvHandler<F> {
    pub fn new(filter: F, protocol_version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(KvHandlerInner {
                entries: HashMap::new(),
                filter,
                snapshot: None,
            })),
            protocol_version: protocol_version.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Compressed serialized filter, as sent in the server hello
    pub fn snapshot(&self) -> Result<Vec<u8>, ProtocolError> {
        if let Some(snapshot) = self.inner.read().snapshot.clone() {
            return Ok(snapshot);
        }
        let mut inner = self.inner.write();
        let snapshot = compress_snapshot(&inner.filter.serialize()?);
        inner.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Answer one post-handshake request
    pub fn handle(&self, message: Message) -> Reply {
        match message {
            Message::Get { key } => Reply::Get(self.get(&key)),
            Message::Put { key, value } => Reply::Put(self.put(&key, value)),
            Message::Del { key, authenticator } => Reply::Del(self.del(&key, &authenticator)),
            Message::GetMany { keys } => Reply::GetMany(
                keys.into_iter()
                    .map(|key| {
                        let result = self.get(&key);
                        (key, result)
                    })
                    .collect(),
            ),
            Message::PutMany { entries } => Reply::PutMany(
                entries
                    .into_iter()
                    .map(|(key, value)| {
                        let result = self.put(&key, value);
                        (key, result)
                    })
                    .collect::<BTreeMap<_, _>>(),
            ),
            Message::DelMany { entries } => Reply::DelMany(
                entries
                    .into_iter()
                    .map(|(key, authenticator)| {
                        let result = self.del(&key, &authenticator);
                        (key, result)
                    })
                    .collect(),
            ),
            Message::ClientHello { .. } => Reply::Error("already connected".to_string()),
            Message::Goodbye => Reply::Error("session closed".to_string()),
        }
    }

    fn get(&self, key: &str) -> GetResult {
        if !validate_key(key) {
            return GetResult::BadKeyFormat;
        }
        match self.inner.read().entries.get(&key.to_ascii_lowercase()) {
            Some(value) => GetResult::Found(value.clone()),
            None => GetResult::NotFound,
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) -> PutResult {
        if !validate_key(key) {
            return PutResult::BadKeyFormat;
        }
        if value.is_empty() {
            return PutResult::ProtocolError;
        }
        let key = key.to_ascii_lowercase();
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&key) {
            return PutResult::KeyTaken;
        }
        inner.filter.insert(key.as_bytes());
        inner.snapshot = None;
        inner.entries.insert(key, value);
        PutResult::Ok
    }

    /// Only the preimage of the key may delete it
    fn del(&self, key: &str, authenticator: &[u8]) -> DelResult {
        if !validate_key(key) {
            return DelResult::BadKeyFormat;
        }
        let key = key.to_ascii_lowercase();
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(&key) {
            return DelResult::NotTaken;
        }
        if authenticator.is_empty() {
            return DelResult::ProtocolError;
        }
        if hex::encode(Sha256::digest(authenticator)) != key {
            tracing::warn!("rejected delete of {}: wrong authenticator", &key[..8]);
            return DelResult::AuthIncorrect;
        }
        inner.entries.remove(&key);
        DelResult::Ok
    }

    /// Drive one client session until it says goodbye or goes away
    pub async fn serve<S>(&self, mut stream: S, max_frame_size: u32) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hello: Message = read_frame(&mut stream, max_frame_size).await?;
        match hello {
            Message::ClientHello { protocol_version } if protocol_version == self.protocol_version => {
                let reply = Reply::ServerHello {
                    membership_snapshot: Some(self.snapshot()?),
                };
                write_frame(&mut stream, &reply).await?;
                tracing::debug!("session started");
            }
            Message::ClientHello { protocol_version } => {
                tracing::warn!(
                    "client speaks {}, we speak {}",
                    protocol_version,
                    self.protocol_version
                );
                let reply = Reply::VersionMismatch {
                    server_version: self.protocol_version.clone(),
                };
                write_frame(&mut stream, &reply).await?;
                return Ok(());
            }
            other => {
                write_frame(&mut stream, &Reply::Error("expected client hello".to_string()))
                    .await?;
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "expected client hello, got {:?}",
                    other
                )));
            }
        }

        loop {
            let message: Message = match read_frame(&mut stream, max_frame_size).await {
                Ok(message) => message,
                Err(ProtocolError::Connection(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    tracing::debug!("client went away");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if message == Message::Goodbye {
                tracing::debug!("session ended");
                return Ok(());
            }
            let reply = self.handle(message);
            write_frame(&mut stream, &reply).await?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::generate_random_identifier;
    use crate::membership::BloomFilter;
    use crate::protocol::{Connection, ConnectionConfig, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};

    fn handler() -> KvHandler<BloomFilter> {
        KvHandler::new(BloomFilter::new(1_000, 0.01), PROTOCOL_VERSION)
    }

    #[test]
    fn test_put_get() {
        let handler = handler();
        let key = "ab".repeat(32);
        assert_eq!(handler.put(&key, vec![1, 2, 3]), PutResult::Ok);
        assert_eq!(handler.put(&key, vec![4]), PutResult::KeyTaken);
        assert_eq!(handler.get(&key), GetResult::Found(vec![1, 2, 3]));
        assert_eq!(handler.get(&"cd".repeat(32)), GetResult::NotFound);
        assert_eq!(handler.get("nope"), GetResult::BadKeyFormat);
        assert_eq!(handler.put(&"ef".repeat(32), vec![]), PutResult::ProtocolError);
    }

    #[test]
    fn test_delete_requires_revocation_token() {
        let handler = handler();
        let tokens = generate_random_identifier();
        let (key, _) = tokens.to_hex();
        handler.put(&key, vec![9]);

        let wrong = generate_random_identifier();
        assert_eq!(
            handler.del(&key, wrong.revocation_token().as_bytes()),
            DelResult::AuthIncorrect
        );
        assert!(handler.contains(&key));

        assert_eq!(
            handler.del(&key, tokens.revocation_token().as_bytes()),
            DelResult::Ok
        );
        assert!(!handler.contains(&key));
        assert_eq!(
            handler.del(&key, tokens.revocation_token().as_bytes()),
            DelResult::NotTaken
        );
    }

    #[test]
    fn test_batch_results_are_per_key() {
        let handler = handler();
        let taken = "11".repeat(32);
        handler.put(&taken, vec![1]);

        let mut entries = BTreeMap::new();
        entries.insert(taken.clone(), vec![2]);
        entries.insert("22".repeat(32), vec![3]);
        entries.insert("bad".to_string(), vec![4]);

        match handler.handle(Message::PutMany { entries }) {
            Reply::PutMany(results) => {
                assert_eq!(results[&taken], PutResult::KeyTaken);
                assert_eq!(results[&"22".repeat(32)], PutResult::Ok);
                assert_eq!(results["bad"], PutResult::BadKeyFormat);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_tracks_puts() {
        let handler = handler();
        let before = handler.snapshot().unwrap();
        handler.put(&"33".repeat(32), vec![1]);
        let after = handler.snapshot().unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_reported() {
        let handler = handler();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.serve(server, DEFAULT_MAX_FRAME_SIZE).await });

        let config = ConnectionConfig {
            protocol_version: "shroud/0".to_string(),
            ..Default::default()
        };
        let result = Connection::<_, BloomFilter>::connect(client, config).await;
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch { ref server, .. }) if server == PROTOCOL_VERSION
        ));
        task.await.unwrap().unwrap();
    }
}
