//! Approximate set membership for server keys
//!
//! The server hands out a snapshot of its filter during the handshake so the
//! client can skip `get`s for keys that are certainly absent. The connection
//! only depends on the [`MembershipFilter`] trait; [`BloomFilter`] is the
//! implementation the server and tests use.

use std::f64::consts::LN_2;

/// Hard cap on a deserialized filter, in 64-bit words (64 MiB)
const MAX_WORDS: u64 = 8 << 20;
const MAX_HASHES: u32 = 32;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("filter encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("invalid filter parameters: {0}")]
    InvalidParameters(&'static str),
}

/// No false negatives, tunable false positives
pub trait MembershipFilter: Sized + Send + Sync + 'static {
    fn insert(&mut self, item: &[u8]);

    /// `false` means the item was certainly never inserted
    fn query(&self, item: &[u8]) -> bool;

    fn serialize(&self) -> Result<Vec<u8>, MembershipError>;

    fn deserialize(bytes: &[u8]) -> Result<Self, MembershipError>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at the given false positive rate
    pub fn new(expected_items: u64, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1) as f64;
        let rate = if false_positive_rate > 0.0 && false_positive_rate < 1.0 {
            false_positive_rate
        } else {
            0.01
        };
        // m = -n ln p / (ln 2)^2
        let num_bits = (-(expected_items * rate.ln()) / (LN_2 * LN_2)).ceil() as u64;
        let num_bits = num_bits.clamp(64, MAX_WORDS * 64);
        Self::with_bits(num_bits, optimal_k_num(num_bits, expected_items))
    }

    fn with_bits(num_bits: u64, num_hashes: u32) -> Self {
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes,
        }
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Bit positions for `item`, by double hashing over one blake3 digest
    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let digest = blake3::hash(item);
        let bytes = digest.as_bytes();
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&bytes[..8]);
        h2.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(h1);
        // odd so every step visits a new position
        let h2 = u64::from_le_bytes(h2) | 1;
        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }
}

impl MembershipFilter for BloomFilter {
    fn insert(&mut self, item: &[u8]) {
        let positions: Vec<u64> = self.positions(item).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    fn query(&self, item: &[u8]) -> bool {
        self.positions(item)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    fn serialize(&self) -> Result<Vec<u8>, MembershipError> {
        Ok(bincode::serialize(self)?)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, MembershipError> {
        let filter: BloomFilter = bincode::deserialize(bytes)?;
        if filter.num_bits == 0 || filter.num_bits > MAX_WORDS * 64 {
            return Err(MembershipError::InvalidParameters("bit count out of range"));
        }
        if filter.bits.len() as u64 != filter.num_bits.div_ceil(64) {
            return Err(MembershipError::InvalidParameters("bit count does not match storage"));
        }
        if filter.num_hashes == 0 || filter.num_hashes > MAX_HASHES {
            return Err(MembershipError::InvalidParameters("hash count out of range"));
        }
        Ok(filter)
    }
}

/// optimal k = (m ln 2) / n, at least 1
fn optimal_k_num(num_bits: u64, expected_items: f64) -> u32 {
    (((num_bits as f64 / expected_items) * LN_2).round() as u32).clamp(1, MAX_HASHES)
}
