//! Integration tests for the per-collection migration gate and its
//! interaction with in-flight chunk migrations.

mod common;

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use shard_catalog::catalog::MigrationPhase;
use shard_catalog::{KeyValue, ShardingError};

use common::{count_on, load_collection, mem_service, owner_of, parked_service, range, shard};

#[tokio::test]
async fn toggling_the_gate_bumps_minor_version_and_normalises_true() {
    let service = mem_service(2);
    let ns = load_collection(&service, "db.gate", 0..4, &[]).await;
    let before = service.catalog().collection(&ns).expect("coll");
    assert_eq!(before.allow_migrations, None);

    let closed = service
        .set_allow_migrations(&ns, false, Some(before.uuid))
        .await
        .expect("close gate");
    assert_eq!(closed.major, before.version.major);
    assert_eq!(closed.minor, before.version.minor + 1);
    assert_eq!(closed.epoch, before.version.epoch);
    let coll = service.catalog().collection(&ns).expect("coll");
    assert_eq!(coll.allow_migrations, Some(false));
    assert!(!service.gate().is_allowed(&ns).expect("read gate"));

    let opened = service
        .set_allow_migrations(&ns, true, None)
        .await
        .expect("open gate");
    assert!(opened.minor > closed.minor);
    let coll = service.catalog().collection(&ns).expect("coll");
    assert_eq!(coll.allow_migrations, None);

    // Chunk ownership and chunk versions are untouched by the toggles.
    let chunks = service.catalog().read(|s| s.chunks(&ns).to_vec());
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].version, before.version);

    // Every shard's cache observed the latest version.
    for node in service.shards() {
        assert_eq!(node.cache().get(&ns).expect("cached").version(), opened);
    }
}

#[tokio::test]
async fn uuid_mismatch_is_rejected_without_changes() {
    let service = mem_service(1);
    let ns = load_collection(&service, "db.uuid", 0..2, &[]).await;
    let before = service.catalog().collection(&ns).expect("coll");

    let err = service
        .set_allow_migrations(&ns, false, Some(Uuid::new_v4()))
        .await
        .expect_err("stale uuid");
    assert!(matches!(err, ShardingError::InvalidUuid { .. }));
    assert_eq!(err.code_name(), "InvalidUUID");
    assert_eq!(service.catalog().collection(&ns).expect("coll"), before);
}

#[tokio::test]
async fn closed_gate_rejects_new_migrations() {
    let service = mem_service(2);
    let ns = load_collection(&service, "db.closed", 0..10, &[5]).await;
    service
        .set_allow_migrations(&ns, false, None)
        .await
        .expect("close gate");

    let err = service
        .move_chunk(&ns, KeyValue::Int(7), &shard(1))
        .await
        .expect_err("gate closed");
    assert!(matches!(err, ShardingError::ConflictingOperationInProgress(_)));
    assert_eq!(owner_of(&service, &ns, 7), shard(0));
    assert!(service.catalog().read(|s| s.migrations.is_empty()));
}

#[tokio::test]
async fn gate_closed_during_catchup_aborts_the_migration() {
    let (service, gate) = parked_service(2, MigrationPhase::Catchup);
    let ns = load_collection(&service, "db.midflight", 0..10, &[5]).await;
    let before = service.catalog().collection(&ns).expect("coll");

    let mover = {
        let service = Arc::clone(&service);
        let ns = ns.clone();
        tokio::spawn(async move { service.move_chunk(&ns, KeyValue::Int(7), &shard(1)).await })
    };
    gate.wait_reached().await;
    // The recipient already holds the cloned documents at this point.
    assert_eq!(count_on(&service, 1, &ns, &range(5, None)), 5);
    service
        .set_allow_migrations(&ns, false, None)
        .await
        .expect("close gate");
    gate.release();

    let err = mover.await.expect("join").expect_err("aborted");
    assert!(matches!(err, ShardingError::ConflictingOperationInProgress(_)));
    assert_eq!(owner_of(&service, &ns, 7), shard(0));
    assert_eq!(count_on(&service, 0, &ns, &range(5, None)), 5);
    assert_eq!(count_on(&service, 1, &ns, &range(5, None)), 0);
    assert!(service.catalog().read(|s| s.migrations.is_empty()));
    let after = service.catalog().collection(&ns).expect("coll");
    assert_eq!(after.version.major, before.version.major);
}

#[tokio::test]
async fn gate_closed_right_before_commit_leaves_ownership_unchanged() {
    let (service, gate) = parked_service(2, MigrationPhase::Committed);
    let ns = load_collection(&service, "db.precommit", 0..10, &[5]).await;

    let mover = {
        let service = Arc::clone(&service);
        let ns = ns.clone();
        tokio::spawn(async move { service.move_chunk(&ns, KeyValue::Int(7), &shard(1)).await })
    };
    gate.wait_reached().await;
    service
        .set_allow_migrations(&ns, false, None)
        .await
        .expect("close gate");
    gate.release();

    let err = mover.await.expect("join").expect_err("commit refused");
    assert!(matches!(err, ShardingError::ConflictingOperationInProgress(_)));
    assert_eq!(owner_of(&service, &ns, 7), shard(0));
    assert!(service.catalog().read(|s| s.migrations.is_empty()));

    // The donor's critical section was lifted by the abort.
    service
        .insert(&ns, json!({"_id": 100, "x": 8}))
        .await
        .expect("write after abort");

    service
        .set_allow_migrations(&ns, true, None)
        .await
        .expect("reopen gate");
}
