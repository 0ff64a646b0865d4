//! Integration tests for the balancer: convergence, collections it must leave
//! alone, and the background loop.

mod common;

use std::time::{Duration, Instant};

use shard_catalog::balancer::{ComplianceViolation, SkipReason};
use shard_catalog::catalog::CatalogStore;
use shard_catalog::{KeyValue, Namespace, ShardingError};

use common::{
    count_on, fast_config, load_collection, mem_service, mem_stores, range, service_with_stores,
    shard,
};

#[tokio::test]
async fn balancer_evens_out_open_collections_and_skips_closed_ones() {
    let service = mem_service(2);
    let coll_a = load_collection(&service, "db.collA", 0..40, &[10, 20, 30]).await;
    let coll_b = load_collection(&service, "db.collB", 0..40, &[10, 20, 30]).await;
    service
        .set_allow_migrations(&coll_b, false, None)
        .await
        .expect("close gate on collB");

    let counts = |ns: &Namespace| service.catalog().read(|s| s.chunk_counts(ns));
    assert_eq!(counts(&coll_a).get(&shard(0)), Some(&4));
    assert_eq!(counts(&coll_a).get(&shard(1)), Some(&0));

    service
        .balance_until_converged(10)
        .await
        .expect("balancer converges");

    assert_eq!(counts(&coll_a).get(&shard(0)), Some(&2));
    assert_eq!(counts(&coll_a).get(&shard(1)), Some(&2));
    assert_eq!(counts(&coll_b).get(&shard(0)), Some(&4));
    assert_eq!(counts(&coll_b).get(&shard(1)), Some(&0));

    let status_a = service.balancer_collection_status(&coll_a).expect("status");
    assert!(status_a.balancer_compliant);
    assert_eq!(status_a.first_compliance_violation, None);
    let status_b = service.balancer_collection_status(&coll_b).expect("status");
    assert!(!status_b.balancer_compliant);
    assert_eq!(
        status_b.first_compliance_violation,
        Some(ComplianceViolation::ChunksImbalance)
    );
    let reported = serde_json::to_value(&status_b).expect("serialize");
    assert_eq!(reported["balancerCompliant"], false);
    assert_eq!(reported["firstComplianceViolation"], "chunksImbalance");

    // Every document of collA is still readable after the moves.
    for x in 0..40 {
        assert_eq!(
            service.find(&coll_a, &KeyValue::Int(x)).await.expect("find").len(),
            1,
            "document {x} lost"
        );
    }

    let report = service.run_balancer_round().await;
    assert!(report.planned.is_empty());
    assert!(report
        .skipped
        .contains(&(coll_b.clone(), SkipReason::MigrationsNotAllowed)));
}

#[tokio::test]
async fn no_balance_collections_are_left_in_place() {
    let service = mem_service(2);
    let ns = load_collection(&service, "db.pinned", 0..30, &[10, 20]).await;
    service
        .configure_collection_balancing(&ns, true)
        .await
        .expect("disable balancing");

    let report = service.run_balancer_round().await;
    assert!(report.planned.is_empty());
    assert!(report.skipped.contains(&(ns.clone(), SkipReason::NoBalance)));

    // Explicit moves still work.
    service
        .move_chunk(&ns, KeyValue::Int(25), &shard(1))
        .await
        .expect("manual move");

    service
        .configure_collection_balancing(&ns, false)
        .await
        .expect("enable balancing");
    let rounds = service.balance_until_converged(5).await.expect("converge");
    assert_eq!(rounds, 0);
}

#[tokio::test]
async fn jumbo_chunks_are_refused_and_skipped() {
    let mut cfg = fast_config();
    cfg.migration.max_chunk_documents = Some(5);
    let service = service_with_stores(CatalogStore::in_memory(), cfg, &mem_stores(2), None);
    let ns = load_collection(&service, "db.jumbo", 0..20, &[10]).await;

    for key in [0, 10] {
        let err = service
            .move_chunk(&ns, KeyValue::Int(key), &shard(1))
            .await
            .expect_err("too big");
        assert!(matches!(err, ShardingError::ChunkTooBig { documents: 10, .. }));
    }
    let jumbo = service
        .catalog()
        .read(|s| s.chunks(&ns).iter().filter(|c| c.jumbo).count());
    assert_eq!(jumbo, 2);
    assert_eq!(count_on(&service, 1, &ns, &range(i64::MIN, None)), 0);

    // Refused again without copying anything.
    let err = service
        .move_chunk(&ns, KeyValue::Int(3), &shard(1))
        .await
        .expect_err("still jumbo");
    assert!(matches!(err, ShardingError::ChunkTooBig { .. }));

    let report = service.run_balancer_round().await;
    assert!(report.planned.is_empty());
    assert!(report.skipped.contains(&(ns.clone(), SkipReason::NoEligibleChunk)));

    // Splitting a jumbo chunk clears the flag on the halves.
    service
        .split_chunk(&ns, KeyValue::Int(15))
        .await
        .expect("split");
    let report = service.run_balancer_round().await;
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].range, range(10, Some(15)));
}

#[tokio::test]
async fn background_loop_balances_only_while_enabled() {
    let stores = mem_stores(3);
    let service = service_with_stores(CatalogStore::in_memory(), fast_config(), &stores, None);
    let ns = load_collection(&service, "db.loop", 0..60, &[10, 20, 30, 40, 50]).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        service.catalog().read(|s| s.chunk_counts(&ns)).get(&shard(0)),
        Some(&6)
    );

    service.start_balancer();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let counts = service.catalog().read(|s| s.chunk_counts(&ns));
        if counts.values().all(|count| *count == 2) {
            break;
        }
        assert!(Instant::now() < deadline, "balancer did not converge: {counts:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    service.stop_balancer();

    let total: u64 = stores
        .iter()
        .map(|store| store.count_range(&ns, &range(i64::MIN, None)).expect("count"))
        .sum();
    assert_eq!(total, 60);
}
