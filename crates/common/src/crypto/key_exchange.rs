//! X25519 key exchange between two peers
//!
//! Each side creates a [`KeyExchange`], sends [`KeyExchange::public_kex_data`]
//! to the other side out of band (e.g. over a local pairing transport), and
//! feeds the partner's bytes into [`KeyExchange::put_partner_kex_data`] exactly
//! once. The agreed secret is then expanded into a [`KeySet`] by whichever side
//! is recorded as the initiator.

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::keyset::KeySet;

/// Size of an encoded X25519 public key in bytes
pub const KEX_PUBLIC_SIZE: usize = 32;
/// Size of the raw Diffie-Hellman output in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// Errors that can occur during the key exchange
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyExchangeError {
    #[error("partner key data was already consumed")]
    AlreadyCompleted,
    #[error("key exchange has not completed")]
    NotCompleted,
    #[error("invalid partner key size, expected {expected}, got {got}")]
    InvalidKeySize { expected: usize, got: usize },
    /// The partner key is a low-order point, the result would be predictable
    #[error("partner key is not contributory")]
    NonContributory,
}

/// One side of an X25519 Diffie-Hellman handshake.
///
/// The private scalar never leaves this struct and is zeroized on drop, as is
/// the agreed secret.
pub struct KeyExchange {
    secret: StaticSecret,
    public: X25519PublicKey,
    agreed: Option<Zeroizing<[u8; SHARED_SECRET_SIZE]>>,
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("completed", &self.agreed.is_some())
            .finish()
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange {
    /// Start a new exchange with a fresh ephemeral keypair from the OS RNG
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self {
            secret,
            public,
            agreed: None,
        }
    }

    /// Encoded public key to hand to the partner
    pub fn public_kex_data(&self) -> [u8; KEX_PUBLIC_SIZE] {
        self.public.to_bytes()
    }

    /// Consume the partner's public key.
    ///
    /// May succeed at most once. Any failure leaves the exchange untouched, so
    /// a rejected key can be followed by a correct one.
    pub fn put_partner_kex_data(&mut self, data: &[u8]) -> Result<(), KeyExchangeError> {
        if self.agreed.is_some() {
            return Err(KeyExchangeError::AlreadyCompleted);
        }
        let bytes: [u8; KEX_PUBLIC_SIZE] =
            data.try_into().map_err(|_| KeyExchangeError::InvalidKeySize {
                expected: KEX_PUBLIC_SIZE,
                got: data.len(),
            })?;

        let partner = X25519PublicKey::from(bytes);
        let shared = self.secret.diffie_hellman(&partner);
        if !shared.was_contributory() {
            tracing::warn!("rejected non-contributory partner key");
            return Err(KeyExchangeError::NonContributory);
        }

        self.agreed = Some(Zeroizing::new(shared.to_bytes()));
        tracing::debug!("key exchange completed");
        Ok(())
    }

    /// Whether the partner key has been consumed successfully
    pub fn is_completed(&self) -> bool {
        self.agreed.is_some()
    }

    /// The raw shared secret. Fails unless the exchange completed.
    pub fn agreed_key(&self) -> Result<&[u8; SHARED_SECRET_SIZE], KeyExchangeError> {
        self.agreed.as_deref().ok_or(KeyExchangeError::NotCompleted)
    }

    /// Expand the agreed secret into this side's [`KeySet`]
    pub fn expand(&self, initiated: bool) -> Result<KeySet, KeyExchangeError> {
        Ok(KeySet::expand(self.agreed_key()?, initiated))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exchange_agrees() {
        let mut alice = KeyExchange::new();
        let mut bob = KeyExchange::new();

        alice.put_partner_kex_data(&bob.public_kex_data()).unwrap();
        bob.put_partner_kex_data(&alice.public_kex_data()).unwrap();

        assert_eq!(alice.agreed_key().unwrap(), bob.agreed_key().unwrap());
    }

    #[test]
    fn test_agreed_key_before_exchange() {
        let kex = KeyExchange::new();
        assert_eq!(kex.agreed_key(), Err(KeyExchangeError::NotCompleted));
        assert!(kex.expand(true).is_err());
    }

    #[test]
    fn test_second_partner_key_rejected() {
        let mut alice = KeyExchange::new();
        let bob = KeyExchange::new();
        let mallory = KeyExchange::new();

        alice.put_partner_kex_data(&bob.public_kex_data()).unwrap();
        let agreed = *alice.agreed_key().unwrap();

        let result = alice.put_partner_kex_data(&mallory.public_kex_data());
        assert_eq!(result, Err(KeyExchangeError::AlreadyCompleted));
        assert_eq!(*alice.agreed_key().unwrap(), agreed);
    }

    #[test]
    fn test_wrong_size_leaves_exchange_usable() {
        let mut alice = KeyExchange::new();
        let bob = KeyExchange::new();

        let result = alice.put_partner_kex_data(&[7u8; 31]);
        assert_eq!(
            result,
            Err(KeyExchangeError::InvalidKeySize {
                expected: KEX_PUBLIC_SIZE,
                got: 31
            })
        );
        assert!(!alice.is_completed());

        alice.put_partner_kex_data(&bob.public_kex_data()).unwrap();
        assert!(alice.is_completed());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let mut alice = KeyExchange::new();
        // the identity point yields an all-zero shared secret
        let result = alice.put_partner_kex_data(&[0u8; KEX_PUBLIC_SIZE]);
        assert_eq!(result, Err(KeyExchangeError::NonContributory));
        assert!(!alice.is_completed());
    }
}
