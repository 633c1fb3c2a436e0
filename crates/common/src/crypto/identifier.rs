//! Storage identifiers and the revocation tokens that authorize deletion
//!
//! Every identifier is `SHA-256(revocation_token)`. The server only ever sees
//! the identifier until a deletion, where presenting the preimage proves
//! ownership.
//!
//! Identifiers come from one of two sources:
//! - [`generate_random_identifier`]: fresh randomness, for the first upload of
//!   a record
//! - [`generate_outbound_identifier`] / [`generate_inbound_identifier`]:
//!   `HMAC-SHA256(key, ctr)` over one direction of a [`KeySet`], so the
//!   recipient can compute where the sender stored its key blob

use std::fmt;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::CryptoError;
use super::keyset::{Counter, KeySet, KeySetError, KEY_SIZE};

/// Size of a storage identifier in bytes
pub const IDENTIFIER_SIZE: usize = 32;
/// Size of a revocation token in bytes
pub const REVOCATION_TOKEN_SIZE: usize = 32;

const TOKEN_DERIVATION_LABEL: &[u8] = b"shroud/identifier/v1";

type HmacSha256 = Hmac<Sha256>;

/// Server-visible storage key of one encrypted blob
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier([u8; IDENTIFIER_SIZE]);

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.to_hex())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; IDENTIFIER_SIZE]> for Identifier {
    fn from(bytes: [u8; IDENTIFIER_SIZE]) -> Self {
        Identifier(bytes)
    }
}

impl TryFrom<&[u8]> for Identifier {
    type Error = CryptoError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; IDENTIFIER_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedInput("invalid identifier size"))?;
        Ok(Identifier(bytes))
    }
}

impl Identifier {
    /// Parse a 64-character hex identifier
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let mut buff = [0; IDENTIFIER_SIZE];
        hex::decode_to_slice(hex, &mut buff)
            .map_err(|_| CryptoError::MalformedInput("identifier hex decode error"))?;
        Ok(Identifier(buff))
    }

    /// Lower-case hex, the form used as a server key
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_SIZE] {
        &self.0
    }
}

/// Preimage of an [`Identifier`]; whoever holds it may delete the blob
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RevocationToken([u8; REVOCATION_TOKEN_SIZE]);

impl fmt::Debug for RevocationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevocationToken([REDACTED])")
    }
}

impl From<[u8; REVOCATION_TOKEN_SIZE]> for RevocationToken {
    fn from(bytes: [u8; REVOCATION_TOKEN_SIZE]) -> Self {
        RevocationToken(bytes)
    }
}

impl RevocationToken {
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let mut buff = [0; REVOCATION_TOKEN_SIZE];
        hex::decode_to_slice(hex, &mut buff)
            .map_err(|_| CryptoError::MalformedInput("revocation token hex decode error"))?;
        Ok(RevocationToken(buff))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; REVOCATION_TOKEN_SIZE] {
        &self.0
    }

    /// The identifier this token unlocks
    pub fn identifier(&self) -> Identifier {
        Identifier(Sha256::digest(self.0).into())
    }
}

/// An identifier together with its revocation token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    identifier: Identifier,
    revocation_token: RevocationToken,
}

impl From<RevocationToken> for TokenPair {
    fn from(revocation_token: RevocationToken) -> Self {
        Self {
            identifier: revocation_token.identifier(),
            revocation_token,
        }
    }
}

impl TokenPair {
    /// Parse the hex form exchanged with the server and the local store.
    ///
    /// Fails if the identifier is not the hash of the token.
    pub fn from_hex(identifier: &str, revocation_token: &str) -> Result<Self, CryptoError> {
        let identifier = Identifier::from_hex(identifier)?;
        let revocation_token = RevocationToken::from_hex(revocation_token)?;
        if revocation_token.identifier() != identifier {
            return Err(CryptoError::MalformedInput(
                "identifier does not match revocation token",
            ));
        }
        Ok(Self {
            identifier,
            revocation_token,
        })
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn revocation_token(&self) -> &RevocationToken {
        &self.revocation_token
    }

    /// `(identifier, revocation_token)` as hex strings
    pub fn to_hex(&self) -> (String, String) {
        (self.identifier.to_hex(), self.revocation_token.to_hex())
    }
}

/// Fresh random token pair from the OS RNG
pub fn generate_random_identifier() -> TokenPair {
    let mut token = [0u8; REVOCATION_TOKEN_SIZE];
    OsRng.fill_bytes(&mut token);
    let pair = TokenPair::from(RevocationToken(token));
    token.zeroize();
    pair
}

/// Token pair for the next blob this side sends to the peer
pub fn generate_outbound_identifier(keyset: &KeySet) -> TokenPair {
    derive_token_pair(keyset.key_out(), keyset.ctr_out())
}

/// Consume the outbound counter; the old `KeySet` must not be used again
pub fn notify_outbound_identifier_used(keyset: KeySet) -> Result<KeySet, KeySetError> {
    keyset.with_next_outbound()
}

/// Token pair under which the peer stores the next blob for this side
pub fn generate_inbound_identifier(keyset: &KeySet) -> TokenPair {
    derive_token_pair(keyset.key_in(), keyset.ctr_in())
}

/// Consume the inbound counter; the old `KeySet` must not be used again
pub fn notify_inbound_identifier_used(keyset: KeySet) -> Result<KeySet, KeySetError> {
    keyset.with_next_inbound()
}

fn derive_token_pair(key: &[u8; KEY_SIZE], counter: &Counter) -> TokenPair {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(TOKEN_DERIVATION_LABEL);
    mac.update(counter.as_bytes());
    let token: [u8; REVOCATION_TOKEN_SIZE] = mac.finalize().into_bytes().into();
    TokenPair::from(RevocationToken(token))
}
