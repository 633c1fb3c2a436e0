//! One-way submissions to research studies
//!
//! A study publishes an RSA public key. Joining draws a fresh per-study
//! secret, sends it inside a hybrid envelope with sequence 0, and derives a
//! [`KeySet`] from it on both ends. Every later envelope carries the next
//! sequence number and is stored under the next outbound identifier of that
//! key set, so the study can find and order submissions without learning
//! anything else about the participant.

use std::collections::{HashMap, HashSet};

use rand::{CryptoRng, RngCore};
use rsa::pkcs8::DecodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{
    decrypt_hybrid, encrypt_hybrid, generate_inbound_identifier, generate_outbound_identifier,
    generate_random_identifier, notify_inbound_identifier_used, notify_outbound_identifier_used,
    ExpectedSequence, Fingerprint, HybridError, KeySet, KeySetError, TokenPair,
    SHARED_SECRET_SIZE,
};

#[derive(Debug, thiserror::Error)]
pub enum StudyError {
    #[error(transparent)]
    Hybrid(#[from] HybridError),
    #[error("message encoding error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("invalid study public key: {0}")]
    PublicKey(#[from] rsa::pkcs8::spki::Error),
    #[error(transparent)]
    KeySet(#[from] KeySetError),
    #[error("unknown participant {0}")]
    UnknownParticipant(Uuid),
    #[error("participant already joined")]
    DuplicateJoin,
    #[error("unexpected study message: {0}")]
    UnexpectedMessage(&'static str),
}

/// A research study a user may join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRequest {
    pub name: String,
    pub institution: String,
    pub description: String,
    pub webpage: String,
    /// SubjectPublicKeyInfo DER of the study's RSA key
    pub public_key_der: Vec<u8>,
    /// Where join envelopes are delivered, as identifier hex
    pub queue_identifier: String,
    /// Reserved for an interactive key exchange with the study
    pub key_exchange: Option<Vec<u8>>,
    /// Per-study key set, present once joined
    pub keyset: Option<KeySet>,
}

impl StudyRequest {
    pub fn public_key(&self) -> Result<RsaPublicKey, StudyError> {
        Ok(RsaPublicKey::from_public_key_der(&self.public_key_der)?)
    }

    pub fn is_joined(&self) -> bool {
        self.keyset.is_some()
    }
}

/// Plaintext of a study envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StudyMessage {
    Join { secret: Vec<u8> },
    Data { payload: Vec<u8> },
    Leave,
}

/// An envelope and the server key it should be stored under
#[derive(Debug, Clone)]
pub struct Submission {
    pub tokens: TokenPair,
    pub sequence: u64,
    pub envelope: Vec<u8>,
}

/// Participant side of a joined study
#[derive(Debug, Clone)]
pub struct Enrollment {
    request: StudyRequest,
    public_key: RsaPublicKey,
    keyset: KeySet,
    next_sequence: u64,
}

impl Enrollment {
    /// Join `request`, returning the enrollment and the join envelope
    /// (sequence 0) to deliver to the study's queue
    pub fn join<R>(rng: &mut R, request: &StudyRequest) -> Result<(Self, Submission), StudyError>
    where
        R: RngCore + CryptoRng,
    {
        let public_key = request.public_key()?;

        let mut secret = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
        rng.fill_bytes(&mut secret[..]);
        let keyset = KeySet::expand(&secret, true);

        let message = Zeroizing::new(bincode::serialize(&StudyMessage::Join {
            secret: secret.to_vec(),
        })?);
        let envelope = encrypt_hybrid(rng, &message, &public_key, 0)?;

        let mut request = request.clone();
        request.keyset = Some(keyset.clone());
        tracing::info!("joined study {}", request.name);

        let enrollment = Self {
            request,
            public_key,
            keyset,
            next_sequence: 1,
        };
        let submission = Submission {
            tokens: generate_random_identifier(),
            sequence: 0,
            envelope,
        };
        Ok((enrollment, submission))
    }

    pub fn request(&self) -> &StudyRequest {
        &self.request
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.keyset.fingerprint()
    }

    /// Seal `payload` for the study. The returned enrollment replaces this
    /// one; reusing the old value would repeat an identifier.
    pub fn submit<R>(self, rng: &mut R, payload: &[u8]) -> Result<(Self, Submission), StudyError>
    where
        R: RngCore + CryptoRng,
    {
        let message = StudyMessage::Data {
            payload: payload.to_vec(),
        };
        self.send(rng, &message)
    }

    /// Final envelope telling the study we are gone
    pub fn leave<R>(self, rng: &mut R) -> Result<Submission, StudyError>
    where
        R: RngCore + CryptoRng,
    {
        let name = self.request.name.clone();
        let (_, submission) = self.send(rng, &StudyMessage::Leave)?;
        tracing::info!("left study {}", name);
        Ok(submission)
    }

    fn send<R>(self, rng: &mut R, message: &StudyMessage) -> Result<(Self, Submission), StudyError>
    where
        R: RngCore + CryptoRng,
    {
        let sequence = self.next_sequence;
        let plaintext = Zeroizing::new(bincode::serialize(message)?);
        let envelope = encrypt_hybrid(rng, &plaintext, &self.public_key, sequence)?;
        let tokens = generate_outbound_identifier(&self.keyset);
        let keyset = notify_outbound_identifier_used(self.keyset)?;

        let mut request = self.request;
        request.keyset = Some(keyset.clone());
        let next = Self {
            request,
            public_key: self.public_key,
            keyset,
            next_sequence: sequence + 1,
        };
        Ok((
            next,
            Submission {
                tokens,
                sequence,
                envelope,
            },
        ))
    }
}

#[derive(Debug, Clone)]
struct Participant {
    keyset: KeySet,
    next_sequence: u64,
}

/// Study side: opens envelopes in order and rejects replays
#[derive(Debug)]
pub struct StudyInbox {
    private_key: RsaPrivateKey,
    participants: HashMap<Uuid, Participant>,
    joined: HashSet<Fingerprint>,
}

impl StudyInbox {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self {
            private_key,
            participants: HashMap::new(),
            joined: HashSet::new(),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants.len()
    }

    /// Open a join envelope and register the participant behind it
    pub fn accept_join(&mut self, envelope: &[u8]) -> Result<Uuid, StudyError> {
        let plaintext = Zeroizing::new(decrypt_hybrid(
            envelope,
            &self.private_key,
            ExpectedSequence::Exact(0),
        )?);
        let secret = match bincode::deserialize(&plaintext)? {
            StudyMessage::Join { secret } => Zeroizing::new(secret),
            _ => return Err(StudyError::UnexpectedMessage("expected join")),
        };
        let secret = Zeroizing::new(
            <[u8; SHARED_SECRET_SIZE]>::try_from(secret.as_slice())
                .map_err(|_| StudyError::UnexpectedMessage("join secret has wrong size"))?,
        );
        let keyset = KeySet::expand(&secret, false);

        if !self.joined.insert(keyset.fingerprint()) {
            tracing::warn!("rejecting repeated join");
            return Err(StudyError::DuplicateJoin);
        }
        let id = Uuid::new_v4();
        self.participants.insert(
            id,
            Participant {
                keyset,
                next_sequence: 1,
            },
        );
        tracing::info!("participant {} joined", id);
        Ok(id)
    }

    /// Where the participant's next envelope will be stored
    pub fn next_identifier(&self, participant: Uuid) -> Result<TokenPair, StudyError> {
        let state = self
            .participants
            .get(&participant)
            .ok_or(StudyError::UnknownParticipant(participant))?;
        Ok(generate_inbound_identifier(&state.keyset))
    }

    /// Open the participant's next envelope. A `Leave` removes them.
    pub fn open(&mut self, participant: Uuid, envelope: &[u8]) -> Result<StudyMessage, StudyError> {
        let state = self
            .participants
            .get(&participant)
            .ok_or(StudyError::UnknownParticipant(participant))?;

        let plaintext = decrypt_hybrid(
            envelope,
            &self.private_key,
            ExpectedSequence::Exact(state.next_sequence),
        )?;
        let message: StudyMessage = bincode::deserialize(&plaintext)?;
        if matches!(message, StudyMessage::Join { .. }) {
            return Err(StudyError::UnexpectedMessage("join after enrollment"));
        }

        let keyset = notify_inbound_identifier_used(state.keyset.clone())?;
        let next_sequence = state.next_sequence + 1;
        if message == StudyMessage::Leave {
            self.participants.remove(&participant);
            tracing::info!("participant {} left", participant);
        } else {
            self.participants.insert(
                participant,
                Participant {
                    keyset,
                    next_sequence,
                },
            );
        }
        Ok(message)
    }
}
