//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use shard_catalog::catalog::{ActiveMigration, CatalogStore, MigrationPhase};
use shard_catalog::config::ServiceConfig;
use shard_catalog::migration::MigrationHook;
use shard_catalog::storage::{DocumentStore, MemDocumentStore, ScanCursor, StoredDocument};
use shard_catalog::{ChunkRange, KeyValue, Namespace, ShardId, ShardingService};

/// Upper bound for waiting on a migration to reach a phase.
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Service config with millisecond-scale backoffs so retry paths stay fast.
pub fn fast_config() -> ServiceConfig {
    let mut cfg = ServiceConfig::default();
    cfg.migration.retry_base = Duration::from_millis(1);
    cfg.migration.retry_max = Duration::from_millis(10);
    cfg.migration.clone_batch_size = 4;
    cfg.balancer.interval = Duration::from_millis(20);
    cfg.cache.refresh_backoff = Duration::from_millis(1);
    cfg
}

pub fn shard(idx: usize) -> ShardId {
    ShardId::new(format!("shard{idx}"))
}

pub fn ns(raw: &str) -> Namespace {
    Namespace::parse(raw).expect("namespace")
}

/// Register one in-memory shard per store slot; returns the service.
pub fn service_with_stores(
    catalog: CatalogStore,
    config: ServiceConfig,
    stores: &[Arc<dyn DocumentStore>],
    hook: Option<Arc<dyn MigrationHook>>,
) -> ShardingService {
    let service = match hook {
        Some(hook) => ShardingService::with_hook(catalog, config, hook),
        None => ShardingService::new(catalog, config),
    };
    for (idx, store) in stores.iter().enumerate() {
        service
            .add_shard(shard(idx), Arc::clone(store))
            .expect("add shard");
    }
    service
}

pub fn mem_stores(count: usize) -> Vec<Arc<dyn DocumentStore>> {
    (0..count)
        .map(|_| Arc::new(MemDocumentStore::new()) as Arc<dyn DocumentStore>)
        .collect()
}

pub fn mem_service(shards: usize) -> ShardingService {
    service_with_stores(
        CatalogStore::in_memory(),
        fast_config(),
        &mem_stores(shards),
        None,
    )
}

/// Shard `raw` on `x` with its primary on shard0, insert one document per
/// key in `keys`, and split at each of `splits`.
pub async fn load_collection(
    service: &ShardingService,
    raw: &str,
    keys: std::ops::Range<i64>,
    splits: &[i64],
) -> Namespace {
    let ns = ns(raw);
    service
        .shard_collection(&ns, "x", &shard(0))
        .await
        .expect("shard collection");
    for x in keys {
        service
            .insert(&ns, json!({"_id": x, "x": x}))
            .await
            .expect("insert");
    }
    for at in splits {
        service
            .split_chunk(&ns, KeyValue::Int(*at))
            .await
            .expect("split");
    }
    ns
}

/// Offset between a document's `x` and its alternative key `y`.
pub const ALT_KEY_OFFSET: i64 = 1000;

/// Insert `{_id: x, x, y: x + ALT_KEY_OFFSET}` for every key, so the
/// collection can be resharded on `y` with keys that never collide with `x`.
pub async fn insert_rekeyable(service: &ShardingService, ns: &Namespace, keys: std::ops::Range<i64>) {
    for x in keys {
        service
            .insert(ns, json!({"_id": x, "x": x, "y": x + ALT_KEY_OFFSET}))
            .await
            .expect("insert");
    }
}

pub fn range(min: i64, max: Option<i64>) -> ChunkRange {
    let max = max.map(KeyValue::Int).unwrap_or(KeyValue::MaxKey);
    let min = if min == i64::MIN {
        KeyValue::MinKey
    } else {
        KeyValue::Int(min)
    };
    ChunkRange::new(min, max).expect("range")
}

pub fn owner_of(service: &ShardingService, ns: &Namespace, key: i64) -> ShardId {
    service
        .catalog()
        .read(|state| state.chunk_for_key(ns, &KeyValue::Int(key)).map(|c| c.shard.clone()))
        .expect("chunk")
}

pub fn count_on(service: &ShardingService, idx: usize, ns: &Namespace, r: &ChunkRange) -> u64 {
    service
        .shard(&shard(idx))
        .expect("shard")
        .count_range(ns, r)
        .expect("count")
}

/// Document store whose scans and batch writes fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemDocumentStore,
    scan_failures: AtomicU32,
    batch_failures: AtomicU32,
}

impl FlakyStore {
    pub fn fail_next_scans(&self, count: u32) {
        self.scan_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_batches(&self, count: u32) {
        self.batch_failures.store(count, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl DocumentStore for FlakyStore {
    fn put(&self, ns: &Namespace, doc: &StoredDocument) -> anyhow::Result<()> {
        self.inner.put(ns, doc)
    }

    fn put_batch(&self, ns: &Namespace, docs: &[StoredDocument]) -> anyhow::Result<()> {
        if take_failure(&self.batch_failures) {
            anyhow::bail!("injected batch write failure");
        }
        self.inner.put_batch(ns, docs)
    }

    fn delete(&self, ns: &Namespace, key: &KeyValue, id: &str) -> anyhow::Result<bool> {
        self.inner.delete(ns, key, id)
    }

    fn find(&self, ns: &Namespace, key: &KeyValue) -> anyhow::Result<Vec<StoredDocument>> {
        self.inner.find(ns, key)
    }

    fn scan_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredDocument>> {
        if take_failure(&self.scan_failures) {
            anyhow::bail!("injected scan failure");
        }
        self.inner.scan_range(ns, range, after, limit)
    }

    fn count_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64> {
        self.inner.count_range(ns, range)
    }

    fn delete_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64> {
        self.inner.delete_range(ns, range)
    }
}

/// Hook that parks a migration right before it enters `phase` until the test
/// releases it.
pub struct PhaseGate {
    phase: MigrationPhase,
    reached: Notify,
    release: Notify,
}

impl PhaseGate {
    pub fn new(phase: MigrationPhase) -> Arc<Self> {
        Arc::new(Self {
            phase,
            reached: Notify::new(),
            release: Notify::new(),
        })
    }

    pub async fn wait_reached(&self) {
        tokio::time::timeout(PHASE_TIMEOUT, self.reached.notified())
            .await
            .expect("migration did not reach the parked phase");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl MigrationHook for PhaseGate {
    async fn before_phase(&self, _migration: &ActiveMigration, phase: MigrationPhase) {
        if phase == self.phase {
            self.reached.notify_one();
            self.release.notified().await;
        }
    }
}

/// Mem-backed service whose migrations park before `phase`.
pub fn parked_service(shards: usize, phase: MigrationPhase) -> (Arc<ShardingService>, Arc<PhaseGate>) {
    let gate = PhaseGate::new(phase);
    let service = service_with_stores(
        CatalogStore::in_memory(),
        fast_config(),
        &mem_stores(shards),
        Some(gate.clone() as Arc<dyn MigrationHook>),
    );
    (Arc::new(service), gate)
}
