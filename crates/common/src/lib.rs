/**
 * Cryptographic types and operations.
 *  - X25519 key exchange and key set expansion
 *  - Storage identifiers and revocation tokens
 *  - Record secrets and the RSA hybrid envelope
 */
pub mod crypto;
/**
 * Approximate membership filter handed out by
 *  the server so clients can skip doomed lookups.
 */
pub mod membership;
/**
 * Length-prefixed client/server protocol for the
 *  untrusted key-value store, both ends.
 */
pub mod protocol;
/**
 * Records, the envelope scheme that encrypts them
 *  for peers, and the share/fetch/revoke workflow.
 */
pub mod sharing;
/**
 * Local persistence of key sets and data blocks.
 */
pub mod store;
/**
 * Hybrid-encrypted submissions to research studies.
 */
pub mod study;
/**
 * In-process server and key set helpers for tests.
 */
pub mod testkit;

pub mod prelude {
    pub use crate::crypto::{KeyExchange, KeySet, TokenPair};
    pub use crate::membership::{BloomFilter, MembershipFilter};
    pub use crate::protocol::{Connection, ConnectionConfig, KvHandler, ProtocolError};
    pub use crate::sharing::{
        fetch_shared, revoke_record, share_record, DataBlock, FriendRef, Granularity, Record,
        SharingError,
    };
    pub use crate::store::{MemoryShareStore, ShareStore, ShareStoreError};
    pub use crate::study::{Enrollment, StudyInbox, StudyRequest};
}
