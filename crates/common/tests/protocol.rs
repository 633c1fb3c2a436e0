//! Integration tests for client sessions against the key-value server

mod common;

use std::collections::BTreeMap;

use ::common::crypto::generate_random_identifier;
use ::common::membership::{BloomFilter, MembershipFilter};
use ::common::protocol::{
    compress_snapshot, read_frame, write_frame, Connection, ConnectionConfig, ConnectionState,
    DelResult, GetResult, Message, ProtocolError, PutResult, Reply, DEFAULT_MAX_FRAME_SIZE,
};
use ::common::testkit::TestServer;
use tokio::io::DuplexStream;

/// Play the server side of a handshake by hand, answering with `hello`
fn fake_server(hello: Reply) -> DuplexStream {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _: Message = read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        write_frame(&mut server, &hello).await.unwrap();
        // answer the first request with an error, then hang up
        if read_frame::<_, Message>(&mut server, DEFAULT_MAX_FRAME_SIZE)
            .await
            .is_ok()
        {
            let _ = write_frame(&mut server, &Reply::Error("go away".to_string())).await;
        }
    });
    client
}

fn valid_snapshot() -> Vec<u8> {
    compress_snapshot(&BloomFilter::new(100, 0.01).serialize().unwrap())
}

#[tokio::test]
async fn test_handshake_and_basic_operations() {
    common::setup_tracing();
    let server = TestServer::new();
    let mut conn = server.connect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    let tokens = generate_random_identifier();
    let key = common::key_of(&tokens);
    assert_eq!(conn.get(&key).await.unwrap(), GetResult::NotFound);
    assert_eq!(conn.put(&key, b"sealed".to_vec()).await.unwrap(), PutResult::Ok);
    assert!(conn.filter().query(key.as_bytes()));
    assert_eq!(
        conn.get(&key).await.unwrap(),
        GetResult::Found(b"sealed".to_vec())
    );
    assert_eq!(
        conn.put(&key, b"other".to_vec()).await.unwrap(),
        PutResult::KeyTaken
    );

    assert_eq!(
        conn.del(&key, b"not the token").await.unwrap(),
        DelResult::AuthIncorrect
    );
    assert_eq!(
        conn.del(&key, tokens.revocation_token().as_bytes())
            .await
            .unwrap(),
        DelResult::Ok
    );
    assert_eq!(
        conn.del(&key, tokens.revocation_token().as_bytes())
            .await
            .unwrap(),
        DelResult::NotTaken
    );
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_bad_keys_never_reach_the_server() {
    common::setup_tracing();
    let server = TestServer::new();
    let mut conn = server.connect().await.unwrap();

    let short = "ab".repeat(31);
    let not_hex = "zz".repeat(32);
    assert_eq!(conn.get(&short).await.unwrap(), GetResult::BadKeyFormat);
    assert_eq!(
        conn.put(&not_hex, vec![1]).await.unwrap(),
        PutResult::BadKeyFormat
    );
    assert_eq!(conn.del(&short, &[1]).await.unwrap(), DelResult::BadKeyFormat);
    assert!(server.handler().is_empty());
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_snapshot_is_taken_at_connect() {
    common::setup_tracing();
    let server = TestServer::new();
    let mut early = server.connect().await.unwrap();

    let mut writer = server.connect().await.unwrap();
    let key = common::key_of(&generate_random_identifier());
    writer.put(&key, vec![7]).await.unwrap();

    // the early session's filter predates the put, so the lookup is
    // answered locally
    assert_eq!(early.get(&key).await.unwrap(), GetResult::NotFound);

    let mut late = server.connect().await.unwrap();
    assert_eq!(late.get(&key).await.unwrap(), GetResult::Found(vec![7]));
}

#[tokio::test]
async fn test_batches_report_per_key() {
    common::setup_tracing();
    let server = TestServer::new();
    let mut conn = server.connect().await.unwrap();

    let taken = generate_random_identifier();
    let fresh = generate_random_identifier();
    let bad = "not a key".to_string();
    conn.put(&common::key_of(&taken), vec![1]).await.unwrap();

    let mut entries = BTreeMap::new();
    entries.insert(common::key_of(&taken), vec![2]);
    entries.insert(common::key_of(&fresh), vec![3]);
    entries.insert(bad.clone(), vec![4]);
    let results = conn.put_many(entries).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[&common::key_of(&taken)], PutResult::KeyTaken);
    assert_eq!(results[&common::key_of(&fresh)], PutResult::Ok);
    assert_eq!(results[&bad], PutResult::BadKeyFormat);

    let missing = common::key_of(&generate_random_identifier());
    let keys = vec![
        common::key_of(&taken),
        common::key_of(&fresh),
        missing.clone(),
        bad.clone(),
    ];
    let found = conn.get_many(&keys).await.unwrap();
    assert_eq!(found[&common::key_of(&taken)], GetResult::Found(vec![1]));
    assert_eq!(found[&common::key_of(&fresh)], GetResult::Found(vec![3]));
    assert_eq!(found[&missing], GetResult::NotFound);
    assert_eq!(found[&bad], GetResult::BadKeyFormat);

    let mut deletes = BTreeMap::new();
    deletes.insert(
        common::key_of(&taken),
        taken.revocation_token().as_bytes().to_vec(),
    );
    deletes.insert(common::key_of(&fresh), vec![0u8; 32]);
    deletes.insert(missing.clone(), vec![1]);
    let deleted = conn.del_many(deletes).await.unwrap();
    assert_eq!(deleted[&common::key_of(&taken)], DelResult::Ok);
    assert_eq!(deleted[&common::key_of(&fresh)], DelResult::AuthIncorrect);
    assert_eq!(deleted[&missing], DelResult::NotTaken);
    assert_eq!(server.handler().len(), 1);
}

#[tokio::test]
async fn test_version_mismatch() {
    common::setup_tracing();
    let server = TestServer::new();
    let config = ConnectionConfig {
        protocol_version: "shroud/0".to_string(),
        ..ConnectionConfig::default()
    };
    match server.connect_with(config).await {
        Err(ProtocolError::VersionMismatch { client, server }) => {
            assert_eq!(client, "shroud/0");
            assert_eq!(server, "shroud/1");
        }
        other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_bad_snapshots_abort_the_handshake() {
    common::setup_tracing();

    let stream = fake_server(Reply::ServerHello {
        membership_snapshot: None,
    });
    let result = Connection::<_, BloomFilter>::connect(stream, ConnectionConfig::default()).await;
    assert!(matches!(result, Err(ProtocolError::MissingSnapshot)));

    let stream = fake_server(Reply::ServerHello {
        membership_snapshot: Some(vec![0xff; 3]),
    });
    let result = Connection::<_, BloomFilter>::connect(stream, ConnectionConfig::default()).await;
    assert!(matches!(result, Err(ProtocolError::Decompression(_))));

    // decompresses fine but is not a filter
    let stream = fake_server(Reply::ServerHello {
        membership_snapshot: Some(compress_snapshot(b"garbage")),
    });
    let result = Connection::<_, BloomFilter>::connect(stream, ConnectionConfig::default()).await;
    assert!(matches!(result, Err(ProtocolError::FilterDeserialize(_))));
}

#[tokio::test]
async fn test_server_error_disconnects() {
    common::setup_tracing();
    let stream = fake_server(Reply::ServerHello {
        membership_snapshot: Some(valid_snapshot()),
    });
    let mut conn = Connection::<_, BloomFilter>::connect(stream, ConnectionConfig::default())
        .await
        .unwrap();

    let key = common::key_of(&generate_random_identifier());
    let result = conn.put(&key, vec![1]).await;
    assert!(matches!(result, Err(ProtocolError::Server(_))));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    assert!(matches!(
        conn.put(&key, vec![1]).await,
        Err(ProtocolError::NotConnected)
    ));
    assert!(matches!(conn.get(&key).await, Err(ProtocolError::NotConnected)));
}

#[tokio::test]
async fn test_key_case_does_not_matter() {
    common::setup_tracing();
    let server = TestServer::new();
    let lower = "ab".repeat(32);
    let upper = "AB".repeat(32);

    let mut conn = server.connect().await.unwrap();
    assert_eq!(conn.put(&lower, vec![5]).await.unwrap(), PutResult::Ok);
    assert_eq!(conn.put(&upper, vec![6]).await.unwrap(), PutResult::KeyTaken);
    assert_eq!(conn.get(&upper).await.unwrap(), GetResult::Found(vec![5]));

    // a fresh session only knows the key from the snapshot
    let mut conn = server.connect().await.unwrap();
    assert!(server.handler().contains(&upper));
    assert_eq!(conn.get(&upper).await.unwrap(), GetResult::Found(vec![5]));
    let found = conn.get_many(&[upper.clone()]).await.unwrap();
    assert_eq!(found[&upper], GetResult::Found(vec![5]));
}

#[tokio::test]
async fn test_repeated_keys_in_batch() {
    common::setup_tracing();
    let server = TestServer::new();
    let lower = "cd".repeat(32);
    let upper = "CD".repeat(32);
    let mut conn = server.connect().await.unwrap();

    let mut entries = BTreeMap::new();
    entries.insert(upper.clone(), vec![1]);
    entries.insert(lower.clone(), vec![2]);
    let results = conn.put_many(entries).await.unwrap();
    assert_eq!(results[&upper], PutResult::Ok);
    assert_eq!(results[&lower], PutResult::KeyTaken);
    assert_eq!(server.handler().len(), 1);

    let keys = vec![lower.clone(), lower.clone(), upper.clone()];
    let found = conn.get_many(&keys).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[&lower], GetResult::Found(vec![1]));
    assert_eq!(found[&upper], GetResult::Found(vec![1]));
}
