//! Hybrid RSA-OAEP + AES-256-GCM envelopes with replay protection
//!
//! Used for one-shot submissions to research studies, where the recipient only
//! publishes an RSA public key.
//!
//! # Wire Format (version 1, frozen)
//!
//! ```text
//! [ version: u32 BE ][ algorithm: u32 BE ][ sequence: u64 BE ][ key_len: u32 BE ]   20 bytes
//! [ RSA-OAEP-SHA256(aes_key): key_len bytes ]
//! [ gcm_nonce: 12 bytes ][ AES-256-GCM(payload) || tag: 16 bytes ]
//! ```
//!
//! The GCM associated data is the header followed by the RSA ciphertext. On
//! decryption the header is rebuilt with the sequence number the receiver
//! expects, so a replayed or edited header fails authentication even if the
//! explicit sequence check were skipped.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::{CryptoRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::error::CryptoError;

/// Current (and only) envelope version
pub const HYBRID_VERSION: u32 = 1;
/// RSA-OAEP with SHA-256 for the key, AES-256-GCM for the payload
pub const HYBRID_ALGORITHM_RSA_OAEP_SHA256_AES256_GCM: u32 = 1;
/// Size of the fixed envelope header in bytes
pub const HYBRID_HEADER_SIZE: usize = 20;

const GCM_NONCE_SIZE: usize = 12;
const AES_KEY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum HybridError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),
}

/// Which sequence number the receiver accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedSequence {
    /// Only this exact sequence number
    Exact(u64),
    /// Whatever the envelope carries. Still authenticated, but replays pass.
    Any,
}

/// Decoded fixed-width envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridHeader {
    pub version: u32,
    pub algorithm: u32,
    pub sequence: u64,
    pub key_ciphertext_len: u32,
}

impl HybridHeader {
    pub fn to_bytes(&self) -> [u8; HYBRID_HEADER_SIZE] {
        let mut out = [0u8; HYBRID_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_be_bytes());
        out[4..8].copy_from_slice(&self.algorithm.to_be_bytes());
        out[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        out[16..20].copy_from_slice(&self.key_ciphertext_len.to_be_bytes());
        out
    }

    /// Parse and validate the header at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < HYBRID_HEADER_SIZE {
            return Err(CryptoError::MalformedInput("envelope shorter than header"));
        }
        let mut word = [0u8; 4];
        let mut dword = [0u8; 8];

        word.copy_from_slice(&data[0..4]);
        let version = u32::from_be_bytes(word);
        word.copy_from_slice(&data[4..8]);
        let algorithm = u32::from_be_bytes(word);
        dword.copy_from_slice(&data[8..16]);
        let sequence = u64::from_be_bytes(dword);
        word.copy_from_slice(&data[16..20]);
        let key_ciphertext_len = u32::from_be_bytes(word);

        if version != HYBRID_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        if algorithm != HYBRID_ALGORITHM_RSA_OAEP_SHA256_AES256_GCM {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm));
        }

        Ok(Self {
            version,
            algorithm,
            sequence,
            key_ciphertext_len,
        })
    }
}

/// Encrypt `message` for the holder of `public_key`, tagged with `sequence`
pub fn encrypt_hybrid<R>(
    rng: &mut R,
    message: &[u8],
    public_key: &RsaPublicKey,
    sequence: u64,
) -> Result<Vec<u8>, HybridError>
where
    R: RngCore + CryptoRng,
{
    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    rng.fill_bytes(&mut key[..]);

    let key_ciphertext = public_key.encrypt(rng, Oaep::new::<Sha256>(), &key[..])?;
    let header = HybridHeader {
        version: HYBRID_VERSION,
        algorithm: HYBRID_ALGORITHM_RSA_OAEP_SHA256_AES256_GCM,
        sequence,
        key_ciphertext_len: u32::try_from(key_ciphertext.len())
            .map_err(|_| CryptoError::MalformedInput("rsa ciphertext too long"))?,
    };

    let mut out = Vec::with_capacity(
        HYBRID_HEADER_SIZE + key_ciphertext.len() + GCM_NONCE_SIZE + message.len() + 16,
    );
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&key_ciphertext);

    let mut nonce = [0u8; GCM_NONCE_SIZE];
    rng.fill_bytes(&mut nonce);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| CryptoError::MalformedInput("invalid key length"))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: message,
                aad: &out,
            },
        )
        .map_err(|_| CryptoError::MalformedInput("payload too long"))?;

    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope, rejecting unknown versions and unexpected sequences
pub fn decrypt_hybrid(
    data: &[u8],
    private_key: &RsaPrivateKey,
    expected: ExpectedSequence,
) -> Result<Vec<u8>, HybridError> {
    let header = HybridHeader::parse(data)?;

    let sequence = match expected {
        ExpectedSequence::Exact(sequence) => {
            if header.sequence != sequence {
                tracing::warn!(
                    "rejecting envelope with sequence {}, expected {}",
                    header.sequence,
                    sequence
                );
                return Err(CryptoError::ReplayDetected {
                    expected: sequence,
                    got: header.sequence,
                }
                .into());
            }
            sequence
        }
        ExpectedSequence::Any => header.sequence,
    };

    let key_len = header.key_ciphertext_len as usize;
    if key_len != private_key.size() {
        return Err(CryptoError::AuthenticationFailure.into());
    }
    let key_end = HYBRID_HEADER_SIZE + key_len;
    if data.len() < key_end + GCM_NONCE_SIZE {
        return Err(CryptoError::MalformedInput("envelope truncated").into());
    }

    let key_ciphertext = &data[HYBRID_HEADER_SIZE..key_end];
    let key = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha256>(), key_ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailure)?,
    );
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| CryptoError::AuthenticationFailure)?;

    let bound = HybridHeader { sequence, ..header };
    let mut aad = Vec::with_capacity(key_end);
    aad.extend_from_slice(&bound.to_bytes());
    aad.extend_from_slice(key_ciphertext);

    let nonce = Nonce::from_slice(&data[key_end..key_end + GCM_NONCE_SIZE]);
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &data[key_end + GCM_NONCE_SIZE..],
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailure)?;
    Ok(plaintext)
}
