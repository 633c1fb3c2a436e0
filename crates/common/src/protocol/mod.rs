//! Client/server protocol for the untrusted key-value store
//!
//! Every message travels as `[u32 BE length][bincode payload]`. A session
//! starts with a version handshake whose reply carries a compressed
//! membership filter snapshot, then continues with strictly sequential
//! request/reply pairs until `Goodbye`.
//!
//! The server only ever sees 64-character hex keys and opaque values.

mod connection;
mod framing;
mod handler;
mod messages;
mod snapshot;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use framing::{encode_frame, read_frame, write_frame};
pub use handler::KvHandler;
pub use messages::{DelResult, GetResult, Message, PutResult, Reply};
pub use snapshot::{compress_snapshot, decompress_snapshot};

/// Version string exchanged in the handshake
pub const PROTOCOL_VERSION: &str = "shroud/1";

/// Largest frame accepted by default, in bytes
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Length of a valid key: 256 bits as hex
pub const KEY_LENGTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("empty frame")]
    EmptyFrame,
    #[error("malformed message: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch { client: String, server: String },
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("server hello carried no membership snapshot")]
    MissingSnapshot,
    #[error("failed to decompress membership snapshot: {0}")]
    Decompression(String),
    #[error("failed to load membership snapshot: {0}")]
    FilterDeserialize(#[from] crate::membership::MembershipError),
    #[error("not connected")]
    NotConnected,
    #[error("server error: {0}")]
    Server(String),
    #[error("batch reply is missing key {0}")]
    IncompleteBatch(String),
}

/// Whether `key` is exactly 64 ASCII hex characters
pub fn validate_key(key: &str) -> bool {
    key.len() == KEY_LENGTH && key.bytes().all(|b| b.is_ascii_hexdigit())
}
