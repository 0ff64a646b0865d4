//! Integration tests for chunk ownership history: snapshot owner resolution,
//! feature-level rewrites and per-collection repair.

mod common;

use shard_catalog::catalog::CatalogCommand;
use shard_catalog::history::{namespace_history_consistent, FeatureLevel, HistoryRewrite};
use shard_catalog::{KeyValue, LogicalTime, Namespace, ShardingError};

use common::{load_collection, mem_service, owner_of, range, shard};

#[tokio::test]
async fn snapshot_owner_follows_recorded_moves() {
    let service = mem_service(3);
    let ns = load_collection(&service, "db.hist", 0..10, &[5]).await;
    let created = service.catalog().collection(&ns).expect("coll").timestamp;

    service
        .move_chunk(&ns, KeyValue::Int(7), &shard(1))
        .await
        .expect("first move");
    let after_first = service.cluster_time();
    service
        .move_chunk(&ns, KeyValue::Int(7), &shard(2))
        .await
        .expect("second move");
    let after_second = service.cluster_time();

    let key = KeyValue::Int(7);
    assert_eq!(
        service.owner_at_cluster_time(&ns, &key, created).expect("owner"),
        shard(0)
    );
    assert_eq!(
        service.owner_at_cluster_time(&ns, &key, after_first).expect("owner"),
        shard(1)
    );
    assert_eq!(
        service.owner_at_cluster_time(&ns, &key, after_second).expect("owner"),
        shard(2)
    );
    let err = service
        .owner_at_cluster_time(&ns, &key, LogicalTime::new(0, 0))
        .expect_err("predates history");
    assert!(matches!(err, ShardingError::NoHistoryAvailable { .. }));

    let chunk = service
        .catalog()
        .read(|s| s.chunk_for_key(&ns, &key).cloned())
        .expect("chunk");
    assert_eq!(chunk.history.len(), 3);
    assert!(chunk
        .history
        .windows(2)
        .all(|pair| pair[0].valid_after < pair[1].valid_after));
    assert_eq!(chunk.history.last().map(|e| e.shard.clone()), Some(shard(2)));

    // The untouched chunk still only knows its creation owner.
    assert_eq!(
        service
            .owner_at_cluster_time(&ns, &KeyValue::Int(1), after_second)
            .expect("owner"),
        shard(0)
    );
}

#[tokio::test]
async fn feature_level_transitions_rewrite_history_everywhere() {
    let service = mem_service(2);
    let first = load_collection(&service, "db.fcvA", 0..10, &[5]).await;
    let second = load_collection(&service, "db.fcvB", 0..4, &[]).await;
    let before = service.catalog().collection(&first).expect("coll").version;

    let report = service
        .set_feature_level(FeatureLevel::LastStable)
        .await
        .expect("downgrade");
    assert_eq!(report.mode, Some(HistoryRewrite::Remove));
    assert_eq!(report.rewritten, vec![first.clone(), second.clone()]);
    assert_eq!(service.catalog().feature_level(), FeatureLevel::LastStable);
    assert!(service.catalog().read(|s| s.pending_history_rewrite.is_none()));

    let after = service.catalog().collection(&first).expect("coll").version;
    assert!(before.is_older_than(&after));
    assert_eq!(after.major, before.major);
    for ns in [&first, &second] {
        let chunks = service.catalog().read(|s| s.chunks(ns).to_vec());
        assert!(namespace_history_consistent(&chunks, FeatureLevel::LastStable));
        for node in service.shards() {
            let cached = node.cache().get(ns).expect("cached");
            assert_eq!(cached.version(), service.catalog().collection(ns).expect("coll").version);
            assert!(cached.chunks.iter().all(|c| c.history.is_empty() && !c.history_enabled));
        }
    }
    let now = service.cluster_time();
    let err = service
        .owner_at_cluster_time(&first, &KeyValue::Int(1), now)
        .expect_err("history removed");
    assert!(matches!(err, ShardingError::NoHistoryAvailable { .. }));

    // Moves under the old level record nothing.
    service
        .move_chunk(&first, KeyValue::Int(7), &shard(1))
        .await
        .expect("move");
    let moved = service
        .catalog()
        .read(|s| s.chunk_for_key(&first, &KeyValue::Int(7)).cloned())
        .expect("chunk");
    assert!(moved.history.is_empty());

    let report = service
        .set_feature_level(FeatureLevel::Latest)
        .await
        .expect("upgrade");
    assert_eq!(report.mode, Some(HistoryRewrite::Add));
    assert_eq!(report.rewritten.len(), 2);
    let chunks = service.catalog().read(|s| s.chunks(&first).to_vec());
    assert!(namespace_history_consistent(&chunks, FeatureLevel::Latest));
    let now = service.cluster_time();
    assert_eq!(
        service
            .owner_at_cluster_time(&first, &KeyValue::Int(7), now)
            .expect("owner"),
        shard(1)
    );

    // Same level again: nothing owed.
    let report = service
        .set_feature_level(FeatureLevel::Latest)
        .await
        .expect("noop");
    assert_eq!(report.mode, None);
    assert!(report.rewritten.is_empty());
}

#[tokio::test]
async fn repair_fixes_partial_history_once() {
    let service = mem_service(2);
    service
        .set_feature_level(FeatureLevel::LastStable)
        .await
        .expect("downgrade");
    let ns = load_collection(&service, "db.repair", 0..20, &[10, 15]).await;

    // Raise the level without running the bulk rewrite, then merge: only the
    // merged chunk gains history.
    service
        .catalog()
        .apply(CatalogCommand::SetFeatureLevel {
            level: FeatureLevel::Latest,
        })
        .expect("raise level");
    service
        .merge_chunks(&ns, range(10, None))
        .await
        .expect("merge");
    let chunks = service.catalog().read(|s| s.chunks(&ns).to_vec());
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].history.is_empty());
    assert_eq!(chunks[1].history.len(), 1);
    assert!(!namespace_history_consistent(&chunks, FeatureLevel::Latest));

    let repaired = service
        .repair_sharded_collection_chunks_history(&ns)
        .await
        .expect("repair")
        .expect("changed");
    let chunks = service.catalog().read(|s| s.chunks(&ns).to_vec());
    assert!(namespace_history_consistent(&chunks, FeatureLevel::Latest));
    assert_eq!(owner_of(&service, &ns, 3), shard(0));

    let again = service
        .repair_sharded_collection_chunks_history(&ns)
        .await
        .expect("repair");
    assert_eq!(again, None);
    assert_eq!(
        service.catalog().collection(&ns).expect("coll").version,
        repaired
    );
    assert_eq!(service.catalog().read(|s| s.chunks(&ns).to_vec()), chunks);

    let err = service
        .repair_sharded_collection_chunks_history(&Namespace::parse("db.missing").expect("ns"))
        .await
        .expect_err("unknown namespace");
    assert!(matches!(err, ShardingError::NamespaceNotFound(_)));
}

#[tokio::test]
async fn move_before_owed_history_removal_never_reports_the_donor() {
    let service = mem_service(2);
    let ns = load_collection(&service, "db.owed", 0..10, &[5]).await;
    service
        .catalog()
        .apply(CatalogCommand::SetFeatureLevel {
            level: FeatureLevel::LastStable,
        })
        .expect("lower level without the bulk rewrite");

    service
        .move_chunk(&ns, KeyValue::Int(7), &shard(1))
        .await
        .expect("move");
    service.catalog().read(|s| s.check_invariants()).expect("invariants");
    let now = service.cluster_time();
    let err = service
        .owner_at_cluster_time(&ns, &KeyValue::Int(7), now)
        .expect_err("moved chunk has no history");
    assert!(matches!(err, ShardingError::NoHistoryAvailable { .. }));

    // The untouched chunk is stripped once the owed rewrite runs.
    service.recover_migrations().await.expect("resume rewrite");
    let chunks = service.catalog().read(|s| s.chunks(&ns).to_vec());
    assert!(namespace_history_consistent(&chunks, FeatureLevel::LastStable));
}
