//! Shared test utilities for sharing and protocol integration tests
#![allow(dead_code)]

use common::crypto::{KeyExchange, TokenPair};
use common::sharing::{FriendRef, LocationTrack, Position, Record, StepCount, StepInterval, TrackMode};
use common::store::{MemoryShareStore, ShareStore};

/// Route library logs to the test harness. Safe to call from every test.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// One device: its local store plus how it refers to its friends
#[derive(Debug, Clone)]
pub struct Device {
    pub store: MemoryShareStore,
}

/// Befriend two devices: run the key exchange and register each side's
/// key set. Returns how `a` refers to `b` and how `b` refers to `a`.
pub async fn befriend(a: &Device, b: &Device) -> (FriendRef, FriendRef) {
    let mut a_kex = KeyExchange::new();
    let mut b_kex = KeyExchange::new();
    a_kex.put_partner_kex_data(&b_kex.public_kex_data()).unwrap();
    b_kex.put_partner_kex_data(&a_kex.public_kex_data()).unwrap();

    let b_as_seen_by_a = FriendRef::new();
    let a_as_seen_by_b = FriendRef::new();
    a.store
        .add_peer(b_as_seen_by_a, a_kex.expand(true).unwrap())
        .await
        .unwrap();
    b.store
        .add_peer(a_as_seen_by_b, b_kex.expand(false).unwrap())
        .await
        .unwrap();
    (b_as_seen_by_a, a_as_seen_by_b)
}

pub fn device() -> Device {
    Device {
        store: MemoryShareStore::new(),
    }
}

pub fn walk() -> Record {
    LocationTrack {
        name: "morning walk".to_string(),
        mode: TrackMode::Walking,
        timestamp_start: 1_700_000_000_000,
        timestamp_end: 1_700_000_900_000,
        positions: (0..5)
            .map(|i| Position {
                latitude: 52.37 + f64::from(i) * 0.001,
                longitude: 4.89,
                altitude: 1.0,
                timestamp: 1_700_000_000_000 + i64::from(i) * 60_000,
            })
            .collect(),
        description: Some("along the canal".to_string()),
        owner: None,
    }
    .into()
}

pub fn steps() -> Record {
    StepCount {
        timestamp_start: 1_700_000_000_000,
        timestamp_end: 1_700_086_400_000,
        total_steps: 9_000,
        intervals: vec![
            StepInterval {
                timestamp: 1_700_000_000_000,
                steps: 4_000,
            },
            StepInterval {
                timestamp: 1_700_043_200_000,
                steps: 5_000,
            },
        ],
        description: None,
        owner: None,
    }
    .into()
}

/// Storage key of a token pair
pub fn key_of(tokens: &TokenPair) -> String {
    tokens.identifier().to_hex()
}
