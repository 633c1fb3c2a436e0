//! Cryptographic primitives for Shroud
//!
//! This module provides everything needed to share records with peers through
//! an untrusted key-value server:
//!
//! - **Key Exchange**: X25519 ephemeral Diffie-Hellman between two peers
//! - **Key Expansion**: HKDF-SHA256 turns the shared secret into a [`KeySet`]
//!   (two directional keys, two directional counters)
//! - **Identifiers**: storage keys are `SHA-256(revocation_token)`, drawn at random
//!   for a record's first upload or derived from a [`KeySet`] counter for
//!   per-recipient key blobs
//! - **Content Encryption**: single-use ChaCha20-Poly1305 [`Secret`]s, bound to
//!   the storage identifier through associated data
//! - **Hybrid Encryption**: RSA-OAEP-SHA256 wrapped AES-256-GCM keys with a
//!   versioned, replay-checked header for research study submissions
//!
//! # Counter Discipline
//!
//! A `(key, counter)` pair of a [`KeySet`] is used as an AEAD key/nonce pair
//! and as identifier derivation input. It must be used at most once. Every
//! consuming operation hands back a successor [`KeySet`] that the caller has to
//! persist before the old value is discarded.

mod error;
mod hybrid;
mod identifier;
mod key_exchange;
mod keyset;
mod secret;

pub use error::CryptoError;
pub use hybrid::{
    decrypt_hybrid, encrypt_hybrid, ExpectedSequence, HybridError, HybridHeader,
    HYBRID_ALGORITHM_RSA_OAEP_SHA256_AES256_GCM, HYBRID_HEADER_SIZE, HYBRID_VERSION,
};
pub use identifier::{
    generate_inbound_identifier, generate_outbound_identifier, generate_random_identifier,
    notify_inbound_identifier_used, notify_outbound_identifier_used, Identifier,
    RevocationToken, TokenPair, IDENTIFIER_SIZE, REVOCATION_TOKEN_SIZE,
};
pub use key_exchange::{KeyExchange, KeyExchangeError, KEX_PUBLIC_SIZE, SHARED_SECRET_SIZE};
pub use keyset::{Counter, Fingerprint, KeySet, KeySetError, COUNTER_SIZE, KEY_SIZE};
pub use secret::{Secret, NONCE_SIZE, SECRET_SIZE};
