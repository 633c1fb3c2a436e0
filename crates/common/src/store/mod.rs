//! Local persistence of peer key sets and shared data blocks
//!
//! The sharing workflow only talks to the [`ShareStore`] trait. Counter
//! state lives here, so `update_keyset` is a compare-and-swap: two tasks
//! racing on the same peer can never both spend the same counter value.

mod memory;
mod provider;

pub use memory::{MemoryShareStore, MemoryShareStoreError};
pub use provider::{OutboundAllocation, Recipient, ShareStore, ShareStoreError};
