use std::collections::{BTreeMap, BTreeSet};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::framing::{encode_frame, read_frame, write_frame};
use super::messages::{DelResult, GetResult, Message, PutResult, Reply};
use super::snapshot::decompress_snapshot;
use super::{validate_key, ProtocolError, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::membership::MembershipFilter;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub protocol_version: String,
    /// Largest reply frame accepted from the server
    pub max_frame_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    ClientHelloSent,
    AwaitingServerHello,
    Connected,
    Disconnected,
}

/// Client side of one session with the key-value server
///
/// Requests are strictly sequential: every operation takes `&mut self` and
/// waits for its reply before returning. Once a transport or protocol
/// error happens the connection is `Disconnected` for good.
#[derive(Debug)]
pub struct Connection<S, F> {
    stream: S,
    filter: F,
    config: ConnectionConfig,
    state: ConnectionState,
}

/// Short, non-identifying form of a key for logs
fn key_prefix(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

/// The form a key is stored, filtered and sent in: lower-case hex.
/// `None` if the key is malformed.
fn normalize_key(key: &str) -> Option<String> {
    validate_key(key).then(|| key.to_ascii_lowercase())
}

impl<S, F> Connection<S, F>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: MembershipFilter,
{
    /// Run the handshake over `stream` and load the server's membership
    /// snapshot.
    ///
    /// Any failure aborts the attempt; there is no degraded mode without a
    /// filter.
    pub async fn connect(mut stream: S, config: ConnectionConfig) -> Result<Self, ProtocolError> {
        let mut state = ConnectionState::Init;
        tracing::debug!(
            "handshake: sending client hello ({})",
            config.protocol_version
        );

        let hello = encode_frame(&Message::ClientHello {
            protocol_version: config.protocol_version.clone(),
        })?;
        stream.write_all(&hello).await?;
        state = state.advance();
        stream.flush().await?;
        state = state.advance();
        tracing::trace!("handshake: {:?}", state);

        let reply: Reply = read_frame(&mut stream, config.max_frame_size).await?;
        let filter = match reply {
            Reply::ServerHello {
                membership_snapshot: Some(snapshot),
            } => {
                let bytes = decompress_snapshot(&snapshot)?;
                F::deserialize(&bytes)?
            }
            Reply::ServerHello {
                membership_snapshot: None,
            } => return Err(ProtocolError::MissingSnapshot),
            Reply::VersionMismatch { server_version } => {
                tracing::warn!(
                    "handshake: server speaks {}, we speak {}",
                    server_version,
                    config.protocol_version
                );
                return Err(ProtocolError::VersionMismatch {
                    client: config.protocol_version,
                    server: server_version,
                });
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "expected server hello, got {:?}",
                    other
                )))
            }
        };
        tracing::info!("connected to key-value server");

        Ok(Self {
            stream,
            filter,
            config,
            state: state.advance(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The local copy of the server's membership filter
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Send one request and wait for its reply
    async fn transceive(&mut self, message: &Message) -> Result<Reply, ProtocolError> {
        if self.state != ConnectionState::Connected {
            return Err(ProtocolError::NotConnected);
        }

        let result = async {
            write_frame(&mut self.stream, message).await?;
            read_frame::<_, Reply>(&mut self.stream, self.config.max_frame_size).await
        }
        .await;

        match result {
            Ok(Reply::Error(reason)) => {
                tracing::error!("server rejected request: {}", reason);
                self.state = ConnectionState::Disconnected;
                Err(ProtocolError::Server(reason))
            }
            Ok(reply) => Ok(reply),
            Err(e) => {
                tracing::error!("connection failed: {}", e);
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    fn unexpected(&mut self, expected: &str, reply: Reply) -> ProtocolError {
        self.state = ConnectionState::Disconnected;
        ProtocolError::UnexpectedMessage(format!("expected {}, got {:?}", expected, reply))
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<GetResult, ProtocolError> {
        self.ensure_connected()?;
        let Some(key) = normalize_key(key) else {
            return Ok(GetResult::BadKeyFormat);
        };
        if !self.filter.query(key.as_bytes()) {
            tracing::debug!("get {}: absent from membership filter", key_prefix(&key));
            return Ok(GetResult::NotFound);
        }

        match self.transceive(&Message::Get { key }).await? {
            Reply::Get(result) => Ok(result),
            other => Err(self.unexpected("get reply", other)),
        }
    }

    pub async fn put(&mut self, key: &str, value: Vec<u8>) -> Result<PutResult, ProtocolError> {
        self.ensure_connected()?;
        let Some(key) = normalize_key(key) else {
            return Ok(PutResult::BadKeyFormat);
        };

        let message = Message::Put {
            key: key.clone(),
            value,
        };
        match self.transceive(&message).await? {
            Reply::Put(result) => {
                if result == PutResult::Ok {
                    self.filter.insert(key.as_bytes());
                }
                Ok(result)
            }
            other => Err(self.unexpected("put reply", other)),
        }
    }

    pub async fn del(&mut self, key: &str, authenticator: &[u8]) -> Result<DelResult, ProtocolError> {
        self.ensure_connected()?;
        let Some(key) = normalize_key(key) else {
            return Ok(DelResult::BadKeyFormat);
        };

        let message = Message::Del {
            key,
            authenticator: authenticator.to_vec(),
        };
        match self.transceive(&message).await? {
            Reply::Del(result) => Ok(result),
            other => Err(self.unexpected("del reply", other)),
        }
    }

    /// Fetch several keys in one round trip. Keys with a bad format or
    /// absent from the filter are answered locally; each distinct key is
    /// asked for once. Results are keyed as the caller spelled them.
    pub async fn get_many(
        &mut self,
        keys: &[String],
    ) -> Result<BTreeMap<String, GetResult>, ProtocolError> {
        self.ensure_connected()?;

        let mut results = BTreeMap::new();
        let mut pending = Vec::new();
        let mut remote = BTreeSet::new();
        for key in keys {
            match normalize_key(key) {
                None => {
                    results.insert(key.clone(), GetResult::BadKeyFormat);
                }
                Some(normal) if !self.filter.query(normal.as_bytes()) => {
                    results.insert(key.clone(), GetResult::NotFound);
                }
                Some(normal) => {
                    remote.insert(normal.clone());
                    pending.push((key.clone(), normal));
                }
            }
        }
        tracing::debug!(
            "get_many: {} keys, {} sent to server",
            keys.len(),
            remote.len()
        );
        if remote.is_empty() {
            return Ok(results);
        }

        let reply = self
            .transceive(&Message::GetMany {
                keys: remote.into_iter().collect(),
            })
            .await?;
        let remote_results = match reply {
            Reply::GetMany(map) => map,
            other => return Err(self.unexpected("get_many reply", other)),
        };
        for (key, normal) in pending {
            let result = remote_results
                .get(&normal)
                .cloned()
                .ok_or_else(|| ProtocolError::IncompleteBatch(normal.clone()))?;
            results.insert(key, result);
        }
        Ok(results)
    }

    /// Store several entries in one round trip; results are per key.
    ///
    /// Keys that differ only in case name the same entry: the first one
    /// goes to the server, the rest are answered `KeyTaken`.
    pub async fn put_many(
        &mut self,
        entries: BTreeMap<String, Vec<u8>>,
    ) -> Result<BTreeMap<String, PutResult>, ProtocolError> {
        self.ensure_connected()?;

        let mut results = BTreeMap::new();
        let mut pending = Vec::new();
        let mut remote = BTreeMap::new();
        for (key, value) in entries {
            let Some(normal) = normalize_key(&key) else {
                results.insert(key, PutResult::BadKeyFormat);
                continue;
            };
            if remote.contains_key(&normal) {
                results.insert(key, PutResult::KeyTaken);
                continue;
            }
            remote.insert(normal.clone(), value);
            pending.push((key, normal));
        }
        if remote.is_empty() {
            return Ok(results);
        }

        let reply = self.transceive(&Message::PutMany { entries: remote }).await?;
        let remote_results = match reply {
            Reply::PutMany(map) => map,
            other => return Err(self.unexpected("put_many reply", other)),
        };
        for (key, normal) in pending {
            let result = remote_results
                .get(&normal)
                .copied()
                .ok_or_else(|| ProtocolError::IncompleteBatch(normal.clone()))?;
            if result == PutResult::Ok {
                self.filter.insert(normal.as_bytes());
            }
            results.insert(key, result);
        }
        Ok(results)
    }

    /// Delete several keys, each with its own authenticator. Keys that
    /// differ only in case share one request and one result.
    pub async fn del_many(
        &mut self,
        entries: BTreeMap<String, Vec<u8>>,
    ) -> Result<BTreeMap<String, DelResult>, ProtocolError> {
        self.ensure_connected()?;

        let mut results = BTreeMap::new();
        let mut pending = Vec::new();
        let mut remote = BTreeMap::new();
        for (key, authenticator) in entries {
            let Some(normal) = normalize_key(&key) else {
                results.insert(key, DelResult::BadKeyFormat);
                continue;
            };
            remote.entry(normal.clone()).or_insert(authenticator);
            pending.push((key, normal));
        }
        if remote.is_empty() {
            return Ok(results);
        }

        let reply = self.transceive(&Message::DelMany { entries: remote }).await?;
        let remote_results = match reply {
            Reply::DelMany(map) => map,
            other => return Err(self.unexpected("del_many reply", other)),
        };
        for (key, normal) in pending {
            let result = remote_results
                .get(&normal)
                .copied()
                .ok_or_else(|| ProtocolError::IncompleteBatch(normal.clone()))?;
            results.insert(key, result);
        }
        Ok(results)
    }

    /// Say goodbye and close the stream
    pub async fn disconnect(mut self) -> Result<(), ProtocolError> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Disconnected;
        write_frame(&mut self.stream, &Message::Goodbye).await?;
        self.stream.shutdown().await?;
        tracing::debug!("disconnected from key-value server");
        Ok(())
    }
}

impl ConnectionState {
    fn advance(self) -> Self {
        match self {
            ConnectionState::Init => ConnectionState::ClientHelloSent,
            ConnectionState::ClientHelloSent => ConnectionState::AwaitingServerHello,
            ConnectionState::AwaitingServerHello => ConnectionState::Connected,
            ConnectionState::Connected | ConnectionState::Disconnected => {
                ConnectionState::Disconnected
            }
        }
    }
}
