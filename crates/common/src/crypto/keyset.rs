//! Per-peer symmetric state derived from a key exchange
//!
//! A [`KeySet`] holds two directional keys and two directional counters.
//! Peers A and B that completed one exchange always satisfy
//! `A.key_out == B.key_in`, `A.key_in == B.key_out`,
//! `A.ctr_out == B.ctr_in` and `A.ctr_in == B.ctr_out`.
//!
//! Counters double as AEAD nonces for the key wrapping in
//! [`KeySet::seal_with_outbound_counter`], so a `KeySet` is an immutable value:
//! advancing a counter produces a new `KeySet` that has to be persisted
//! before the old one is dropped.

use std::fmt;

use aes_gcm::aead::consts::U32;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::CryptoError;
use super::key_exchange::SHARED_SECRET_SIZE;

/// Size of a directional key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of a directional counter in bytes
pub const COUNTER_SIZE: usize = 32;

const LABEL_KEY_INITIATOR: &[u8] = b"shroud/keyset/v1/key/initiator";
const LABEL_KEY_RESPONDER: &[u8] = b"shroud/keyset/v1/key/responder";
const LABEL_CTR_INITIATOR: &[u8] = b"shroud/keyset/v1/ctr/initiator";
const LABEL_CTR_RESPONDER: &[u8] = b"shroud/keyset/v1/ctr/responder";

/// AES-256-GCM with the full 256-bit counter as IV
type CounterCipher = AesGcm<Aes256, U32>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeySetError {
    /// Incrementing would wrap the 256-bit counter back to a used value
    #[error("counter exhausted")]
    CounterExhausted,
}

/// A 256-bit big-endian counter
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Zeroize)]
pub struct Counter([u8; COUNTER_SIZE]);

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter([REDACTED])")
    }
}

impl From<[u8; COUNTER_SIZE]> for Counter {
    fn from(bytes: [u8; COUNTER_SIZE]) -> Self {
        Counter(bytes)
    }
}

impl Counter {
    pub fn as_bytes(&self) -> &[u8; COUNTER_SIZE] {
        &self.0
    }

    /// The next counter value, or `None` if the counter is at its maximum
    pub fn checked_next(&self) -> Option<Counter> {
        let mut next = self.0;
        for byte in next.iter_mut().rev() {
            let (value, carry) = byte.overflowing_add(1);
            *byte = value;
            if !carry {
                return Some(Counter(next));
            }
        }
        None
    }
}

/// Human-comparable digest of a [`KeySet`], identical on both peers
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    /// Upper-case hex in groups of four characters
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode_upper(self.0);
        let groups: Vec<&str> = hex
            .as_bytes()
            .chunks(4)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .collect();
        f.write_str(&groups.join(" "))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Directional keys and counters shared with exactly one peer
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    key_in: [u8; KEY_SIZE],
    key_out: [u8; KEY_SIZE],
    ctr_in: Counter,
    ctr_out: Counter,
    #[zeroize(skip)]
    initiated: bool,
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("fingerprint", &self.fingerprint())
            .field("initiated", &self.initiated)
            .finish()
    }
}

impl KeySet {
    /// Rebuild a key set from its parts, e.g. when loading from storage
    pub fn from_parts(
        key_in: [u8; KEY_SIZE],
        key_out: [u8; KEY_SIZE],
        ctr_in: Counter,
        ctr_out: Counter,
        initiated: bool,
    ) -> Self {
        Self {
            key_in,
            key_out,
            ctr_in,
            ctr_out,
            initiated,
        }
    }

    /// Derive both directions from a Diffie-Hellman shared secret.
    ///
    /// The initiator sends with the "initiator" labels and receives with the
    /// "responder" labels; the responder does the opposite.
    pub fn expand(shared_secret: &[u8; SHARED_SECRET_SIZE], initiated: bool) -> Self {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let initiator_key = derive(&hk, LABEL_KEY_INITIATOR);
        let responder_key = derive(&hk, LABEL_KEY_RESPONDER);
        let initiator_ctr = Counter(derive(&hk, LABEL_CTR_INITIATOR));
        let responder_ctr = Counter(derive(&hk, LABEL_CTR_RESPONDER));

        if initiated {
            Self::from_parts(
                responder_key,
                initiator_key,
                responder_ctr,
                initiator_ctr,
                true,
            )
        } else {
            Self::from_parts(
                initiator_key,
                responder_key,
                initiator_ctr,
                responder_ctr,
                false,
            )
        }
    }

    pub fn key_in(&self) -> &[u8; KEY_SIZE] {
        &self.key_in
    }

    pub fn key_out(&self) -> &[u8; KEY_SIZE] {
        &self.key_out
    }

    pub fn ctr_in(&self) -> &Counter {
        &self.ctr_in
    }

    pub fn ctr_out(&self) -> &Counter {
        &self.ctr_out
    }

    pub fn initiated(&self) -> bool {
        self.initiated
    }

    /// SHA-256 over the four fields in initiator order, so both peers get
    /// the same value while their counters are in step.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        if self.initiated {
            hasher.update(self.key_out);
            hasher.update(self.key_in);
            hasher.update(self.ctr_out.as_bytes());
            hasher.update(self.ctr_in.as_bytes());
        } else {
            hasher.update(self.key_in);
            hasher.update(self.key_out);
            hasher.update(self.ctr_in.as_bytes());
            hasher.update(self.ctr_out.as_bytes());
        }
        Fingerprint(hasher.finalize().into())
    }

    /// Successor with `ctr_out` advanced by one
    pub fn with_next_outbound(&self) -> Result<KeySet, KeySetError> {
        let mut next = self.clone();
        next.ctr_out = self
            .ctr_out
            .checked_next()
            .ok_or(KeySetError::CounterExhausted)?;
        Ok(next)
    }

    /// Successor with `ctr_in` advanced by one
    pub fn with_next_inbound(&self) -> Result<KeySet, KeySetError> {
        let mut next = self.clone();
        next.ctr_in = self
            .ctr_in
            .checked_next()
            .ok_or(KeySetError::CounterExhausted)?;
        Ok(next)
    }

    /// Encrypt under `key_out` with `ctr_out` as the nonce.
    ///
    /// The nonce is never transmitted; the receiving peer knows it as its
    /// `ctr_in`. Does not advance the counter.
    pub fn seal_with_outbound_counter(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = CounterCipher::new_from_slice(&self.key_out)
            .map_err(|_| CryptoError::MalformedInput("invalid key length"))?;
        cipher
            .encrypt(Nonce::<U32>::from_slice(self.ctr_out.as_bytes()), plaintext)
            .map_err(|_| CryptoError::MalformedInput("plaintext too long"))
    }

    /// Decrypt under `key_in` with `ctr_in` as the nonce
    pub fn open_with_inbound_counter(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = CounterCipher::new_from_slice(&self.key_in)
            .map_err(|_| CryptoError::MalformedInput("invalid key length"))?;
        cipher
            .decrypt(Nonce::<U32>::from_slice(self.ctr_in.as_bytes()), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailure)
    }
}

fn derive(hk: &Hkdf<Sha256>, label: &[u8]) -> [u8; 32] {
    let mut okm = [0u8; 32];
    hk.expand(label, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}
