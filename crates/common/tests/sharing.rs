//! Integration tests for sharing records between devices through the server

mod common;

use ::common::protocol::{DelResult, PutResult};
use ::common::sharing::{
    fetch_shared, revoke_record, share_record, FriendRef, Granularity, Record, WorkflowError,
};
use ::common::store::{ShareStore, ShareStoreError};
use ::common::testkit::TestServer;

#[tokio::test]
async fn test_share_and_fetch() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let bob = common::device();
    let (bob_ref, alice_ref) = common::befriend(&alice, &bob).await;

    let mut conn = server.connect().await.unwrap();
    let report = share_record(
        &mut conn,
        &alice.store,
        &common::walk(),
        Granularity::Fine,
        &[bob_ref],
    )
    .await
    .unwrap();
    assert_eq!(report.record, PutResult::Ok);
    assert!(report.local_id.is_some());
    assert_eq!(report.delivered_to().collect::<Vec<_>>(), vec![&bob_ref]);

    share_record(
        &mut conn,
        &alice.store,
        &common::steps(),
        Granularity::Coarse,
        &[bob_ref],
    )
    .await
    .unwrap();
    conn.disconnect().await.unwrap();

    // a fresh session sees both uploads in its filter snapshot
    let mut conn = server.connect().await.unwrap();
    let fetched = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert_eq!(fetched.unavailable, 0);
    assert_eq!(fetched.records.len(), 2);

    let mut expected_walk = common::walk();
    expected_walk.set_owner(Some(alice_ref));
    assert_eq!(fetched.records[0].1, expected_walk);

    match &fetched.records[1].1 {
        Record::StepCount(steps) => {
            assert_eq!(steps.total_steps, 9_000);
            assert!(steps.intervals.is_empty());
            assert_eq!(steps.owner, Some(alice_ref));
        }
        other => panic!("expected step count, got {:?}", other),
    }

    // the fetched blocks are kept locally, owned by alice
    let (local_id, _) = &fetched.records[0];
    let block = bob.store.data_block(*local_id).await.unwrap();
    assert_eq!(block.owner, Some(alice_ref));
    assert!(block.revocation_token.is_none());

    // nothing new the second time
    let again = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert!(again.records.is_empty());
}

#[tokio::test]
async fn test_share_with_several_friends() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let bob = common::device();
    let carol = common::device();
    let (bob_ref, alice_for_bob) = common::befriend(&alice, &bob).await;
    let (carol_ref, alice_for_carol) = common::befriend(&alice, &carol).await;

    let mut conn = server.connect().await.unwrap();
    let report = share_record(
        &mut conn,
        &alice.store,
        &common::walk(),
        Granularity::Coarse,
        &[bob_ref, carol_ref],
    )
    .await
    .unwrap();
    assert_eq!(report.delivered_to().count(), 2);
    // one record blob plus one wrapped key per friend
    assert_eq!(server.handler().len(), 3);

    let local_id = report.local_id.unwrap();
    assert_eq!(alice.store.recipients(local_id).await.unwrap().len(), 2);

    let mut conn = server.connect().await.unwrap();
    let for_bob = fetch_shared(&mut conn, &bob.store, alice_for_bob).await.unwrap();
    let for_carol = fetch_shared(&mut conn, &carol.store, alice_for_carol)
        .await
        .unwrap();
    assert_eq!(for_bob.records.len(), 1);
    assert_eq!(for_carol.records.len(), 1);

    match &for_carol.records[0].1 {
        Record::LocationTrack(track) => {
            assert_eq!(track.name, "morning walk");
            assert!(track.positions.is_empty());
        }
        other => panic!("expected location track, got {:?}", other),
    }
}

#[tokio::test]
async fn test_revoke_removes_everything() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let bob = common::device();
    let (bob_ref, alice_ref) = common::befriend(&alice, &bob).await;

    let mut conn = server.connect().await.unwrap();
    let report = share_record(
        &mut conn,
        &alice.store,
        &common::walk(),
        Granularity::Fine,
        &[bob_ref],
    )
    .await
    .unwrap();
    let local_id = report.local_id.unwrap();

    let revoked = revoke_record(&mut conn, &alice.store, local_id).await.unwrap();
    assert_eq!(revoked.record, DelResult::Ok);
    assert_eq!(revoked.recipients, vec![(bob_ref, DelResult::Ok)]);
    assert!(revoked.removed);
    assert!(server.handler().is_empty());
    assert!(matches!(
        alice.store.data_block(local_id).await,
        Err(ShareStoreError::BlockNotFound(_))
    ));

    let mut conn = server.connect().await.unwrap();
    let fetched = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert!(fetched.records.is_empty());
    assert_eq!(fetched.unavailable, 0);
}

#[tokio::test]
async fn test_record_deleted_before_fetch_is_unavailable() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let bob = common::device();
    let (bob_ref, alice_ref) = common::befriend(&alice, &bob).await;

    let mut conn = server.connect().await.unwrap();
    let report = share_record(
        &mut conn,
        &alice.store,
        &common::steps(),
        Granularity::Fine,
        &[bob_ref],
    )
    .await
    .unwrap();

    // drop only the record blob, leaving bob's wrapped key behind
    let block = alice
        .store
        .data_block(report.local_id.unwrap())
        .await
        .unwrap();
    let token = block.revocation_token.unwrap();
    let result = conn
        .del(&block.identifier.to_hex(), token.as_bytes())
        .await
        .unwrap();
    assert_eq!(result, DelResult::Ok);

    let mut conn = server.connect().await.unwrap();
    let fetched = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert!(fetched.records.is_empty());
    assert_eq!(fetched.unavailable, 1);

    // the wrapped key was still consumed
    let again = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert_eq!(again.unavailable, 0);
}

#[tokio::test]
async fn test_only_uploader_can_revoke() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let bob = common::device();
    let (bob_ref, alice_ref) = common::befriend(&alice, &bob).await;

    let mut conn = server.connect().await.unwrap();
    share_record(
        &mut conn,
        &alice.store,
        &common::walk(),
        Granularity::Fine,
        &[bob_ref],
    )
    .await
    .unwrap();

    let mut conn = server.connect().await.unwrap();
    let fetched = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    let (local_id, _) = fetched.records[0].clone();

    let result = revoke_record(&mut conn, &bob.store, local_id).await;
    assert!(matches!(result, Err(WorkflowError::NotOwner(id)) if id == local_id));
    assert_eq!(server.handler().len(), 2);
}

#[tokio::test]
async fn test_share_with_stranger_fails_before_upload() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let stranger = FriendRef::new();

    let mut conn = server.connect().await.unwrap();
    let result = share_record(
        &mut conn,
        &alice.store,
        &common::walk(),
        Granularity::Fine,
        &[stranger],
    )
    .await;
    assert!(matches!(
        result,
        Err(WorkflowError::Store(ShareStoreError::UnknownPeer(peer))) if peer == stranger
    ));
    assert!(server.handler().is_empty());
}

#[tokio::test]
async fn test_fetch_steps_over_failed_share() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let bob = common::device();
    let (bob_ref, alice_ref) = common::befriend(&alice, &bob).await;

    // the transport dies before the batch is answered; the counter value
    // reserved for bob is spent without anything stored under it
    let mut broken = server.connect_failing_after(0).await.unwrap();
    let result = share_record(
        &mut broken,
        &alice.store,
        &common::walk(),
        Granularity::Fine,
        &[bob_ref],
    )
    .await;
    assert!(matches!(result, Err(WorkflowError::Protocol(_))));

    let mut conn = server.connect().await.unwrap();
    let report = share_record(
        &mut conn,
        &alice.store,
        &common::steps(),
        Granularity::Fine,
        &[bob_ref],
    )
    .await
    .unwrap();
    assert_eq!(report.delivered_to().count(), 1);

    let mut conn = server.connect().await.unwrap();
    let fetched = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert_eq!(fetched.records.len(), 1);
    assert_eq!(fetched.unavailable, 0);
    assert!(matches!(fetched.records[0].1, Record::StepCount(_)));

    // later shares keep arriving after the hole
    let mut conn = server.connect().await.unwrap();
    share_record(
        &mut conn,
        &alice.store,
        &common::walk(),
        Granularity::Coarse,
        &[bob_ref],
    )
    .await
    .unwrap();
    let mut conn = server.connect().await.unwrap();
    let fetched = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert_eq!(fetched.records.len(), 1);
    assert!(matches!(fetched.records[0].1, Record::LocationTrack(_)));
}

#[tokio::test]
async fn test_interrupted_fetch_keeps_inbound_counter() {
    common::setup_tracing();
    let server = TestServer::new();
    let alice = common::device();
    let bob = common::device();
    let (bob_ref, alice_ref) = common::befriend(&alice, &bob).await;

    let mut conn = server.connect().await.unwrap();
    share_record(
        &mut conn,
        &alice.store,
        &common::walk(),
        Granularity::Fine,
        &[bob_ref],
    )
    .await
    .unwrap();

    // wrapped keys are answered, the record lookup is not
    let before = bob.store.keyset(alice_ref).await.unwrap();
    let mut broken = server.connect_failing_after(1).await.unwrap();
    let result = fetch_shared(&mut broken, &bob.store, alice_ref).await;
    assert!(matches!(result, Err(WorkflowError::Protocol(_))));
    assert_eq!(bob.store.keyset(alice_ref).await.unwrap(), before);

    let mut conn = server.connect().await.unwrap();
    let fetched = fetch_shared(&mut conn, &bob.store, alice_ref).await.unwrap();
    assert_eq!(fetched.records.len(), 1);
    assert_ne!(bob.store.keyset(alice_ref).await.unwrap(), before);
}
