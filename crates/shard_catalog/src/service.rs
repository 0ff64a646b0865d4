//! Operation surface for the sharding subsystem.
//!
//! `ShardingService` wires the catalog, the shard nodes and their caches, the
//! migration gate, the coordinator and the balancer together. Every catalog
//! write that bumps a collection version is followed by a refresh of the
//! shard caches so routing converges without waiting for a stale-config
//! round trip.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use crate::balancer::{Balancer, CollectionBalanceStatus, RoundReport};
use crate::cache::{CacheConfig, ShardCatalogCache};
use crate::catalog::{CatalogCommand, CatalogStore, ReshardOperation};
use crate::config::ServiceConfig;
use crate::error::{Result, ShardingError};
use crate::gate::MigrationGate;
use crate::history::{self, FeatureLevel, HistoryRewriteJob, HistoryRewriteReport};
use crate::migration::{
    MigrationCoordinator, MigrationHook, MigrationOutcome, MoveChunkRequest, RecoveryReport,
};
use crate::shard::{ShardNode, ShardSet};
use crate::storage::{DocumentStore, ScanCursor, StoredDocument};
use crate::types::{ChunkRange, KeyValue, LogicalTime, Namespace, ShardId, ShardKeyPattern};
use crate::version::ChunkVersion;

/// Shard key used for collections tracked without an explicit key.
const UNSPLITTABLE_KEY_FIELD: &str = "_id";

pub struct ShardingService {
    catalog: CatalogStore,
    shards: ShardSet,
    gate: MigrationGate,
    coordinator: Arc<MigrationCoordinator>,
    balancer: Arc<Balancer>,
    history_job: HistoryRewriteJob,
    cache_config: CacheConfig,
    balancer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ShardingService {
    pub fn new(catalog: CatalogStore, config: ServiceConfig) -> Self {
        Self::build(catalog, config, None)
    }

    /// Like [`ShardingService::new`], with `hook` observing every migration
    /// phase transition.
    pub fn with_hook(
        catalog: CatalogStore,
        config: ServiceConfig,
        hook: Arc<dyn MigrationHook>,
    ) -> Self {
        Self::build(catalog, config, Some(hook))
    }

    fn build(
        catalog: CatalogStore,
        config: ServiceConfig,
        hook: Option<Arc<dyn MigrationHook>>,
    ) -> Self {
        let shards = ShardSet::default();
        let mut coordinator =
            MigrationCoordinator::new(catalog.clone(), shards.clone(), config.migration);
        if let Some(hook) = hook {
            coordinator = coordinator.with_hook(hook);
        }
        let coordinator = Arc::new(coordinator);
        let balancer = Arc::new(Balancer::new(
            catalog.clone(),
            Arc::clone(&coordinator),
            config.balancer,
        ));
        Self {
            gate: MigrationGate::new(catalog.clone()),
            history_job: HistoryRewriteJob::new(catalog.clone()),
            catalog,
            shards,
            coordinator,
            balancer,
            cache_config: config.cache,
            balancer_task: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn gate(&self) -> &MigrationGate {
        &self.gate
    }

    pub fn shard(&self, id: &ShardId) -> Result<Arc<ShardNode>> {
        self.shards.get(id)
    }

    pub fn shards(&self) -> Vec<Arc<ShardNode>> {
        self.shards.all()
    }

    /// Register a shard backed by `store`. Re-adding a known id replaces its
    /// node (and starts it with an empty cache).
    pub fn add_shard(&self, id: ShardId, store: Arc<dyn DocumentStore>) -> Result<Arc<ShardNode>> {
        self.catalog
            .apply(CatalogCommand::AddShard { shard: id.clone() })?;
        let cache = Arc::new(ShardCatalogCache::new(
            id.clone(),
            self.catalog.clone(),
            self.cache_config.clone(),
        ));
        let node = Arc::new(ShardNode::new(id.clone(), store, cache));
        self.shards.insert(Arc::clone(&node));
        tracing::info!(shard = %id, "added shard");
        Ok(node)
    }

    /// Shard `ns` on the single field `key_field`. The whole key space starts
    /// as one chunk on `primary`.
    pub async fn shard_collection(
        &self,
        ns: &Namespace,
        key_field: &str,
        primary: &ShardId,
    ) -> Result<Uuid> {
        let key_pattern = ShardKeyPattern::new(key_field)?;
        self.create_collection(ns, key_pattern, primary, false).await
    }

    /// Track `ns` as an unsplittable collection living entirely on `primary`.
    /// It can still be moved as a whole.
    pub async fn track_unsplittable_collection(
        &self,
        ns: &Namespace,
        primary: &ShardId,
    ) -> Result<Uuid> {
        let key_pattern = ShardKeyPattern::new(UNSPLITTABLE_KEY_FIELD)?;
        self.create_collection(ns, key_pattern, primary, true).await
    }

    async fn create_collection(
        &self,
        ns: &Namespace,
        key_pattern: ShardKeyPattern,
        primary: &ShardId,
        unsplittable: bool,
    ) -> Result<Uuid> {
        self.shards.get(primary)?;
        let uuid = Uuid::new_v4();
        let version = self
            .catalog
            .apply(CatalogCommand::ShardCollection {
                ns: ns.clone(),
                uuid,
                epoch: Uuid::new_v4(),
                key_pattern,
                primary: primary.clone(),
                unsplittable,
            })?;
        tracing::info!(ns = %ns, %uuid, primary = %primary, unsplittable, "created sharded collection");
        self.refresh_caches(ns, version).await;
        Ok(uuid)
    }

    /// Split the chunk containing `at` so that `at` becomes a chunk boundary.
    /// Returns `None` when `at` already is one.
    pub async fn split_chunk(&self, ns: &Namespace, at: KeyValue) -> Result<Option<ChunkVersion>> {
        let version = self.catalog.apply(CatalogCommand::SplitChunk {
            ns: ns.clone(),
            at: at.clone(),
        })?;
        if version.is_some() {
            tracing::debug!(ns = %ns, at = %at, "split chunk");
            self.refresh_caches(ns, version).await;
        }
        Ok(version)
    }

    pub async fn merge_chunks(&self, ns: &Namespace, range: ChunkRange) -> Result<ChunkVersion> {
        let version = self
            .catalog
            .apply(CatalogCommand::MergeChunks {
                ns: ns.clone(),
                range: range.clone(),
            })?
            .ok_or_else(|| ShardingError::Internal(format!("merge of {range} did not bump {ns}")))?;
        tracing::debug!(ns = %ns, range = %range, version = %version, "merged chunks");
        self.refresh_caches(ns, Some(version)).await;
        Ok(version)
    }

    pub async fn move_chunk(
        &self,
        ns: &Namespace,
        find: KeyValue,
        to: &ShardId,
    ) -> Result<MigrationOutcome> {
        self.coordinator
            .move_chunk(MoveChunkRequest {
                ns: ns.clone(),
                find,
                to: to.clone(),
            })
            .await
    }

    pub fn cancel_migration(&self, ns: &Namespace, key: &KeyValue) -> Result<()> {
        self.coordinator.cancel(ns, key)
    }

    /// Finish or roll back migrations and reshards left behind by a previous
    /// process and drain any history rewrite a feature-level change left
    /// pending.
    pub async fn recover_migrations(&self) -> Result<RecoveryReport> {
        self.recover_reshards().await?;
        let report = self.coordinator.recover().await?;
        let rewrite = self.history_job.run()?;
        for ns in &rewrite.rewritten {
            self.refresh_caches(ns, None).await;
        }
        Ok(report)
    }

    pub async fn set_allow_migrations(
        &self,
        ns: &Namespace,
        allowed: bool,
        expected_uuid: Option<Uuid>,
    ) -> Result<ChunkVersion> {
        let version = self.gate.set_allow_migrations(ns, allowed, expected_uuid)?;
        self.refresh_caches(ns, Some(version)).await;
        Ok(version)
    }

    /// Exclude `ns` from (or return it to) automatic balancing. Explicit
    /// `move_chunk` requests are unaffected.
    pub async fn configure_collection_balancing(
        &self,
        ns: &Namespace,
        no_balance: bool,
    ) -> Result<ChunkVersion> {
        let version = self
            .catalog
            .apply(CatalogCommand::SetNoBalance {
                ns: ns.clone(),
                no_balance,
            })?
            .ok_or_else(|| {
                ShardingError::Internal(format!("balancing toggle on {ns} did not bump the version"))
            })?;
        tracing::info!(ns = %ns, no_balance, "configured collection balancing");
        self.refresh_caches(ns, Some(version)).await;
        Ok(version)
    }

    pub fn balancer_collection_status(&self, ns: &Namespace) -> Result<CollectionBalanceStatus> {
        self.balancer.collection_status(ns)
    }

    /// Make the chunk history of `ns` consistent with the current feature
    /// level. Returns the bumped version, or `None` when nothing changed.
    pub async fn repair_sharded_collection_chunks_history(
        &self,
        ns: &Namespace,
    ) -> Result<Option<ChunkVersion>> {
        let version = self
            .catalog
            .apply(CatalogCommand::RepairChunksHistory { ns: ns.clone() })?;
        if version.is_some() {
            tracing::info!(ns = %ns, "repaired chunk history");
            self.refresh_caches(ns, version).await;
        }
        Ok(version)
    }

    /// Change the cluster feature level and run the history rewrite the
    /// transition requires.
    pub async fn set_feature_level(&self, level: FeatureLevel) -> Result<HistoryRewriteReport> {
        self.catalog
            .apply(CatalogCommand::SetFeatureLevel { level })?;
        let report = self.history_job.run()?;
        tracing::info!(%level, rewritten = report.rewritten.len(), "set feature level");
        for ns in &report.rewritten {
            self.refresh_caches(ns, None).await;
        }
        Ok(report)
    }

    pub async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        self.catalog
            .apply(CatalogCommand::DropCollection { ns: ns.clone() })?;
        let full = ChunkRange::full();
        for node in self.shards.all() {
            node.delete_range(ns, &full)?;
            node.cache().evict(ns);
        }
        tracing::info!(ns = %ns, "dropped collection");
        Ok(())
    }

    /// Re-shard `ns` on `key_field`. The collection keeps its uuid but starts
    /// a new epoch with a single chunk; all documents are rewritten onto the
    /// primary shard under the new key. Writes to `ns` are blocked on every
    /// shard for the duration, and a durable reshard marker keeps migrations,
    /// splits and merges of `ns` out until the data is settled.
    pub async fn reshard_collection(&self, ns: &Namespace, key_field: &str) -> Result<ChunkVersion> {
        let key_pattern = ShardKeyPattern::new(key_field)?;
        let coll = self.catalog.collection(ns)?;
        let operation = ReshardOperation {
            ns: ns.clone(),
            epoch: Uuid::new_v4(),
            key_pattern,
            previous_key_pattern: coll.key_pattern,
            primary: coll.primary_shard,
        };
        self.catalog.apply(CatalogCommand::BeginReshard {
            operation: operation.clone(),
        })?;

        let full = ChunkRange::full();
        let nodes = self.shards.all();
        for node in &nodes {
            node.enter_critical_section(ns, &full);
        }
        let staged = self.stage_reshard(&operation, &nodes);
        let settled = self.settle_reshard(&operation, &nodes);
        for node in &nodes {
            node.exit_critical_section(ns, &full);
        }
        self.refresh_caches(ns, None).await;

        let version = match (staged, settled) {
            (Ok(version), Ok(_)) => version,
            (Err(err), settled) => {
                if let Err(settle_err) = settled {
                    tracing::warn!(ns = %ns, error = ?settle_err, "reshard rollback incomplete, left for recovery");
                }
                return Err(err);
            }
            (Ok(_), Err(err)) => return Err(err),
        };
        tracing::info!(ns = %ns, key = key_field, version = %version, "resharded collection");
        Ok(version)
    }

    /// Copy every document onto the primary under the new key, then commit
    /// the new epoch. Existing copies are left in place; the old and new
    /// layouts coexist until `settle_reshard` runs.
    fn stage_reshard(
        &self,
        operation: &ReshardOperation,
        nodes: &[Arc<ShardNode>],
    ) -> Result<ChunkVersion> {
        let ns = &operation.ns;
        let primary = self.shards.get(&operation.primary)?;
        let full = ChunkRange::full();
        let batch = self.coordinator.config().clone_batch_size.max(1);

        let mut rekeyed = Vec::new();
        for node in nodes {
            let mut after: Option<ScanCursor> = None;
            loop {
                let page = node.scan_range(ns, &full, after.as_ref(), batch)?;
                let Some(last) = page.last() else {
                    break;
                };
                after = Some((last.key.clone(), last.id.clone()));
                let exhausted = page.len() < batch;
                for stored in page {
                    rekeyed.push(StoredDocument {
                        key: operation.key_pattern.extract(&stored.doc)?,
                        id: stored.id,
                        doc: stored.doc,
                    });
                }
                if exhausted {
                    break;
                }
            }
        }
        for page in rekeyed.chunks(batch) {
            primary.receive_documents(ns, page)?;
        }

        self.catalog
            .apply(CatalogCommand::ReshardCollection {
                ns: ns.clone(),
                key_pattern: operation.key_pattern.clone(),
                epoch: operation.epoch,
            })?
            .ok_or_else(|| ShardingError::Internal(format!("reshard of {ns} did not bump")))
    }

    /// Bring every shard's data in line with whatever the catalog committed:
    /// the new layout when the new epoch is installed, the old one otherwise.
    /// Clears the reshard marker once every shard is settled. Returns whether
    /// the reshard had committed.
    fn settle_reshard(&self, operation: &ReshardOperation, nodes: &[Arc<ShardNode>]) -> Result<bool> {
        let ns = &operation.ns;
        let (coll, chunks) = self.catalog.collection_and_chunks(ns)?;
        let committed = coll.epoch == operation.epoch;
        let batch = self.coordinator.config().clone_batch_size;
        for node in nodes {
            node.retain_owned(ns, &coll.key_pattern, &chunks, batch)?;
        }
        self.catalog
            .apply(CatalogCommand::EndReshard { ns: ns.clone() })?;
        if !committed {
            tracing::info!(ns = %ns, "rolled back reshard");
        }
        Ok(committed)
    }

    /// Settle reshards a previous process left behind.
    async fn recover_reshards(&self) -> Result<()> {
        let pending = self
            .catalog
            .read(|state| state.reshards.values().cloned().collect::<Vec<_>>());
        let full = ChunkRange::full();
        let nodes = self.shards.all();
        for operation in pending {
            let ns = &operation.ns;
            for node in &nodes {
                node.enter_critical_section(ns, &full);
            }
            let settled = self.settle_reshard(&operation, &nodes);
            for node in &nodes {
                node.exit_critical_section(ns, &full);
            }
            let committed = settled?;
            tracing::info!(ns = %ns, committed, "recovered interrupted reshard");
            self.refresh_caches(ns, None).await;
        }
        Ok(())
    }

    // Document routing. Requests carry the catalog's current collection
    // version; a shard whose cache disagrees answers `StaleConfig`, and the
    // request is retried once after refreshing that shard's cache.

    pub async fn insert(&self, ns: &Namespace, doc: Value) -> Result<()> {
        let key = self.catalog.collection(ns)?.key_pattern.extract(&doc)?;
        self.routed(ns, &key, |node, version| node.insert(ns, version, doc.clone()))
            .await
    }

    pub async fn delete(&self, ns: &Namespace, key: &KeyValue, id: &str) -> Result<bool> {
        self.routed(ns, key, |node, version| node.delete(ns, version, key, id))
            .await
    }

    pub async fn find(&self, ns: &Namespace, key: &KeyValue) -> Result<Vec<Value>> {
        self.routed(ns, key, |node, version| node.find(ns, version, key))
            .await
    }

    async fn routed<T>(
        &self,
        ns: &Namespace,
        key: &KeyValue,
        op: impl Fn(&ShardNode, &ChunkVersion) -> Result<T>,
    ) -> Result<T> {
        let mut refreshed = false;
        loop {
            let (owner, version) = self.catalog.read(|state| {
                let version = state.collection(ns)?.version;
                let chunk = state.chunk_for_key(ns, key)?;
                Ok::<_, ShardingError>((chunk.shard.clone(), version))
            })?;
            let node = self.shards.get(&owner)?;
            match op(node.as_ref(), &version) {
                Err(ShardingError::StaleConfig { .. }) if !refreshed => {
                    refreshed = true;
                    node.cache().refresh(ns, Some(version)).await?;
                }
                other => return other,
            }
        }
    }

    /// Shard that owned `key` of `ns` at cluster time `at`, resolved from the
    /// chunk's ownership history.
    pub fn owner_at_cluster_time(
        &self,
        ns: &Namespace,
        key: &KeyValue,
        at: LogicalTime,
    ) -> Result<ShardId> {
        self.catalog.read(|state| {
            let chunk = state.chunk_for_key(ns, key)?;
            history::owner_at(chunk, at)
        })
    }

    pub fn cluster_time(&self) -> LogicalTime {
        self.catalog.read(|state| state.cluster_time)
    }

    // Balancer.

    /// Enable balancing, spawning the background loop on first use.
    pub fn start_balancer(&self) {
        self.balancer.start();
        let mut task = self.balancer_task.lock().unwrap();
        if task.is_none() {
            *task = Some(Arc::clone(&self.balancer).spawn());
        }
    }

    pub fn stop_balancer(&self) {
        self.balancer.stop();
    }

    pub async fn run_balancer_round(&self) -> RoundReport {
        self.balancer.run_round().await
    }

    pub async fn balance_until_converged(&self, max_rounds: usize) -> Result<usize> {
        self.balancer.balance_until_converged(max_rounds).await
    }

    async fn refresh_caches(&self, ns: &Namespace, min_version: Option<ChunkVersion>) {
        for node in self.shards.all() {
            if let Err(err) = node.cache().refresh(ns, min_version).await {
                tracing::warn!(shard = %node.id(), ns = %ns, error = ?err, "cache refresh after catalog write failed");
            }
        }
    }
}

impl Drop for ShardingService {
    fn drop(&mut self) {
        if let Ok(task) = self.balancer_task.get_mut() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
