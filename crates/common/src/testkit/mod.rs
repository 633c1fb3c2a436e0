//! In-process harness for protocol and sharing tests
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testkit::{keyset_pair, TestServer};
//!
//! #[tokio::test]
//! async fn test_put_get() -> anyhow::Result<()> {
//!     let server = TestServer::new();
//!     let mut conn = server.connect().await?;
//!     conn.put(&"ab".repeat(32), vec![1]).await?;
//!     Ok(())
//! }
//! ```

use tokio::io::DuplexStream;

use crate::crypto::{KeyExchange, KeySet};
use crate::membership::BloomFilter;
use crate::protocol::{
    read_frame, write_frame, Connection, ConnectionConfig, KvHandler, Message, ProtocolError,
    Reply, DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION,
};

const DUPLEX_BUFFER_SIZE: usize = 256 * 1024;

/// A key-value server whose sessions run as tokio tasks over in-memory pipes
#[derive(Debug, Clone)]
pub struct TestServer {
    handler: KvHandler<BloomFilter>,
}

impl Default for TestServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TestServer {
    pub fn new() -> Self {
        Self {
            handler: KvHandler::new(BloomFilter::new(10_000, 0.01), PROTOCOL_VERSION),
        }
    }

    pub fn handler(&self) -> &KvHandler<BloomFilter> {
        &self.handler
    }

    /// Open a new session with the default client config
    pub async fn connect(&self) -> Result<Connection<DuplexStream, BloomFilter>, ProtocolError> {
        self.connect_with(ConnectionConfig::default()).await
    }

    pub async fn connect_with(
        &self,
        config: ConnectionConfig,
    ) -> Result<Connection<DuplexStream, BloomFilter>, ProtocolError> {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.serve(server, DEFAULT_MAX_FRAME_SIZE).await {
                tracing::debug!("test session ended with error: {}", e);
            }
        });
        Connection::connect(client, config).await
    }

    /// Open a session whose transport dies after `requests` answered
    /// requests: the next request is read and the stream dropped without a
    /// reply.
    pub async fn connect_failing_after(
        &self,
        requests: usize,
    ) -> Result<Connection<DuplexStream, BloomFilter>, ProtocolError> {
        let (client, mut server) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let session = async {
                let _: Message = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await?;
                let hello = Reply::ServerHello {
                    membership_snapshot: Some(handler.snapshot()?),
                };
                write_frame(&mut server, &hello).await?;
                for _ in 0..requests {
                    let message: Message = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await?;
                    write_frame(&mut server, &handler.handle(message)).await?;
                }
                let _: Message = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await?;
                Ok::<_, ProtocolError>(())
            };
            if let Err(e) = session.await {
                tracing::debug!("failing test session ended early: {}", e);
            }
        });
        Connection::connect(client, ConnectionConfig::default()).await
    }
}

/// Run a full key exchange and return `(initiator, responder)` key sets
pub fn keyset_pair() -> (KeySet, KeySet) {
    let mut alice = KeyExchange::new();
    let mut bob = KeyExchange::new();
    let alice_public = alice.public_kex_data();
    let bob_public = bob.public_kex_data();
    alice
        .put_partner_kex_data(&bob_public)
        .expect("fresh key exchange accepts a partner key");
    bob.put_partner_kex_data(&alice_public)
        .expect("fresh key exchange accepts a partner key");
    (
        alice.expand(true).expect("exchange completed"),
        bob.expand(false).expect("exchange completed"),
    )
}
