//! Chunk migration coordinator.
//!
//! A migration moves one chunk from a donor shard to a recipient shard:
//!
//! - `Requested`: a durable marker is installed for the chunk. The marker is
//!   the per-chunk mutual-exclusion lock and all that recovery needs.
//! - `Cloning`: the donor starts capturing writes to the range and the
//!   recipient copies the range page by page.
//! - `Catchup`: captured writes are replayed on the recipient until the
//!   backlog is small.
//! - `CommitPending`: the donor blocks writes to the range and the last
//!   captured writes are drained. Operator cancellation is no longer honoured.
//! - `Committed`: one catalog command reassigns the chunk, bumps the version
//!   and appends history. Nothing after this point is rolled back.
//!
//! The migration gate is checked at admission, at every checkpoint, and again
//! inside the commit command itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::catalog::{ActiveMigration, CatalogCommand, CatalogState, CatalogStore, MigrationPhase};
use crate::error::{Result, ShardingError};
use crate::gate;
use crate::history;
use crate::shard::{CaptureId, ShardNode, ShardSet};
use crate::storage::ScanCursor;
use crate::types::{unix_time_ms, ChunkRange, KeyValue, Namespace, ShardId};
use crate::version::{ChunkVersion, VersionBump};

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Documents per clone page and per catch-up round.
    pub clone_batch_size: usize,
    /// Captured-write backlog at or below which catch-up is considered done.
    pub catchup_threshold: usize,
    pub max_catchup_rounds: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Retries per step before a transient failure aborts the migration.
    pub max_retries: u32,
    /// Upper bound on each of the cloning and catch-up phases.
    pub phase_timeout: Duration,
    /// Chunks holding more documents are refused and marked jumbo.
    pub max_chunk_documents: Option<u64>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 256,
            catchup_threshold: 0,
            max_catchup_rounds: 64,
            retry_base: Duration::from_millis(50),
            retry_max: Duration::from_secs(5),
            max_retries: 5,
            phase_timeout: Duration::from_secs(60),
            max_chunk_documents: None,
        }
    }
}

/// Observer invoked before the coordinator enters each phase.
#[async_trait]
pub trait MigrationHook: Send + Sync {
    async fn before_phase(&self, migration: &ActiveMigration, phase: MigrationPhase);
}

#[derive(Debug, Clone)]
pub struct MoveChunkRequest {
    pub ns: Namespace,
    /// Any key inside the chunk to move.
    pub find: KeyValue,
    pub to: ShardId,
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub id: String,
    pub ns: Namespace,
    pub range: ChunkRange,
    pub from: ShardId,
    pub to: ShardId,
    pub version: ChunkVersion,
    pub documents_cloned: u64,
    pub catchup_rounds: u32,
    /// False when post-commit cleanup ran out of retries; `recover` finishes it.
    pub cleanup_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub finished: Vec<String>,
    pub aborted: Vec<String>,
}

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    past_cancel_point: bool,
}

struct CloneStats {
    documents_cloned: u64,
    catchup_rounds: u32,
}

pub struct MigrationCoordinator {
    catalog: CatalogStore,
    shards: ShardSet,
    config: MigrationConfig,
    hook: Option<Arc<dyn MigrationHook>>,
    running: Mutex<HashMap<String, CancelState>>,
}

impl MigrationCoordinator {
    pub fn new(catalog: CatalogStore, shards: ShardSet, config: MigrationConfig) -> Self {
        Self {
            catalog,
            shards,
            config,
            hook: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn MigrationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Move the chunk containing `req.find` to `req.to`.
    pub async fn move_chunk(&self, req: MoveChunkRequest) -> Result<MigrationOutcome> {
        let chunk = self
            .catalog
            .read(|state| state.chunk_for_key(&req.ns, &req.find).cloned())?;
        if chunk.shard == req.to {
            return Err(ShardingError::InvalidOptions(format!(
                "chunk {} of {} is already on {}",
                chunk.range, req.ns, req.to
            )));
        }
        let donor = self.shards.get(&chunk.shard)?;
        let recipient = self.shards.get(&req.to)?;
        if chunk.jumbo {
            let documents = donor.count_range(&req.ns, &chunk.range)?;
            return Err(ShardingError::ChunkTooBig {
                ns: req.ns.clone(),
                range: chunk.range.clone(),
                documents,
            });
        }

        let marker = ActiveMigration {
            id: Uuid::new_v4().to_string(),
            ns: req.ns.clone(),
            range: chunk.range.clone(),
            from: chunk.shard.clone(),
            to: req.to.clone(),
            phase: MigrationPhase::Requested,
            started_unix_ms: unix_time_ms(),
            committed_version: None,
        };
        self.catalog.apply(CatalogCommand::BeginMigration {
            migration: marker.clone(),
        })?;
        self.running
            .lock()
            .unwrap()
            .insert(marker.id.clone(), CancelState::default());
        tracing::info!(
            id = %marker.id,
            ns = %marker.ns,
            range = %marker.range,
            from = %marker.from,
            to = %marker.to,
            "chunk migration started"
        );

        let result = self.run(&marker, &donor, &recipient).await;
        self.running.lock().unwrap().remove(&marker.id);
        result
    }

    async fn run(
        &self,
        marker: &ActiveMigration,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
    ) -> Result<MigrationOutcome> {
        let capture = donor.start_capture(&marker.ns, &marker.range);
        let (version, stats) = match self.copy_and_commit(marker, donor, recipient, capture).await {
            Ok(committed) => committed,
            Err(err) => {
                tracing::warn!(
                    id = %marker.id,
                    ns = %marker.ns,
                    range = %marker.range,
                    error = ?err,
                    "chunk migration aborted"
                );
                self.abort_cleanup(marker, donor, recipient, Some(capture)).await;
                return Err(err);
            }
        };
        let cleanup_complete = self
            .commit_cleanup(marker, version, donor, recipient, Some(capture))
            .await;
        tracing::info!(
            id = %marker.id,
            ns = %marker.ns,
            range = %marker.range,
            to = %marker.to,
            version = %version,
            documents = stats.documents_cloned,
            "chunk migration committed"
        );
        Ok(MigrationOutcome {
            id: marker.id.clone(),
            ns: marker.ns.clone(),
            range: marker.range.clone(),
            from: marker.from.clone(),
            to: marker.to.clone(),
            version,
            documents_cloned: stats.documents_cloned,
            catchup_rounds: stats.catchup_rounds,
            cleanup_complete,
        })
    }

    /// Everything up to and including the commit command. An error means the
    /// catalog still names the donor as owner.
    async fn copy_and_commit(
        &self,
        marker: &ActiveMigration,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
        capture: CaptureId,
    ) -> Result<(ChunkVersion, CloneStats)> {
        self.enter_phase(marker, MigrationPhase::Cloning).await?;
        let documents_cloned = self
            .within_phase_timeout(
                MigrationPhase::Cloning,
                self.clone_range(marker, donor, recipient),
            )
            .await?;

        self.enter_phase(marker, MigrationPhase::Catchup).await?;
        let catchup_rounds = self
            .within_phase_timeout(
                MigrationPhase::Catchup,
                self.catch_up(marker, donor, recipient, capture),
            )
            .await?;

        self.enter_phase(marker, MigrationPhase::CommitPending).await?;
        donor.enter_critical_section(&marker.ns, &marker.range);
        self.drain_all(marker, donor, recipient, capture).await?;
        self.catalog.read(|state| gate::ensure_allowed(state, &marker.ns))?;

        if let Some(hook) = &self.hook {
            hook.before_phase(marker, MigrationPhase::Committed).await;
        }
        let version = self
            .catalog
            .apply(CatalogCommand::CommitMigration {
                id: marker.id.clone(),
            })?
            .ok_or_else(|| {
                ShardingError::Internal(format!("commit of {} produced no version", marker.id))
            })?;
        Ok((
            version,
            CloneStats {
                documents_cloned,
                catchup_rounds,
            },
        ))
    }

    async fn enter_phase(&self, marker: &ActiveMigration, phase: MigrationPhase) -> Result<()> {
        if let Some(hook) = &self.hook {
            hook.before_phase(marker, phase).await;
        }
        if phase == MigrationPhase::CommitPending {
            // Checking the cancel flag and persisting the phase under the same
            // lock makes `cancel` and this transition mutually exclusive.
            let mut running = self.running.lock().unwrap();
            let cancel = running.entry(marker.id.clone()).or_default();
            if cancel.cancelled {
                return Err(ShardingError::MigrationCancelled(marker.id.clone()));
            }
            self.catalog.read(|state| gate::ensure_allowed(state, &marker.ns))?;
            self.catalog.apply(CatalogCommand::AdvanceMigration {
                id: marker.id.clone(),
                phase,
            })?;
            cancel.past_cancel_point = true;
        } else {
            self.checkpoint(marker)?;
            self.catalog.apply(CatalogCommand::AdvanceMigration {
                id: marker.id.clone(),
                phase,
            })?;
        }
        tracing::debug!(id = %marker.id, ns = %marker.ns, ?phase, "migration phase");
        Ok(())
    }

    /// Safe abort point: operator cancel and gate closure are observed here.
    fn checkpoint(&self, marker: &ActiveMigration) -> Result<()> {
        let cancelled = self
            .running
            .lock()
            .unwrap()
            .get(&marker.id)
            .map(|c| c.cancelled && !c.past_cancel_point)
            .unwrap_or(false);
        if cancelled {
            return Err(ShardingError::MigrationCancelled(marker.id.clone()));
        }
        self.catalog.read(|state| gate::ensure_allowed(state, &marker.ns))
    }

    async fn within_phase_timeout<T>(
        &self,
        phase: MigrationPhase,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.phase_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ShardingError::Timeout(format!(
                "migration phase {phase:?} exceeded {:?}",
                self.config.phase_timeout
            ))),
        }
    }

    async fn clone_range(
        &self,
        marker: &ActiveMigration,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
    ) -> Result<u64> {
        if let Some(max) = self.config.max_chunk_documents {
            let documents = self
                .with_retry(marker, "count range", || {
                    donor.count_range(&marker.ns, &marker.range)
                })
                .await?;
            if documents > max {
                self.catalog.apply(CatalogCommand::MarkJumbo {
                    ns: marker.ns.clone(),
                    min: marker.range.min.clone(),
                })?;
                return Err(ShardingError::ChunkTooBig {
                    ns: marker.ns.clone(),
                    range: marker.range.clone(),
                    documents,
                });
            }
        }

        let batch = self.config.clone_batch_size.max(1);
        let mut cursor: Option<ScanCursor> = None;
        let mut cloned = 0u64;
        loop {
            self.checkpoint(marker)?;
            let page = self
                .with_retry(marker, "clone scan", || {
                    donor.scan_range(&marker.ns, &marker.range, cursor.as_ref(), batch)
                })
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some((last.key.clone(), last.id.clone()));
            self.with_retry(marker, "clone apply", || {
                recipient.receive_documents(&marker.ns, &page)
            })
            .await?;
            cloned += page.len() as u64;
            if page.len() < batch {
                break;
            }
        }
        Ok(cloned)
    }

    async fn catch_up(
        &self,
        marker: &ActiveMigration,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
        capture: CaptureId,
    ) -> Result<u32> {
        let mut rounds = 0u32;
        loop {
            self.checkpoint(marker)?;
            if donor.capture_backlog(capture) <= self.config.catchup_threshold {
                return Ok(rounds);
            }
            if rounds >= self.config.max_catchup_rounds {
                return Err(ShardingError::Timeout(format!(
                    "migration {} did not catch up within {} rounds",
                    marker.id, self.config.max_catchup_rounds
                )));
            }
            let changes = donor.drain_capture(capture, self.config.clone_batch_size.max(1));
            self.with_retry(marker, "catchup apply", || {
                recipient.apply_changes(&marker.ns, &changes)
            })
            .await?;
            rounds += 1;
        }
    }

    async fn drain_all(
        &self,
        marker: &ActiveMigration,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
        capture: CaptureId,
    ) -> Result<()> {
        loop {
            let changes = donor.drain_capture(capture, self.config.clone_batch_size.max(1));
            if changes.is_empty() {
                return Ok(());
            }
            self.with_retry(marker, "final drain", || {
                recipient.apply_changes(&marker.ns, &changes)
            })
            .await?;
        }
    }

    async fn with_retry<T>(
        &self,
        marker: &ActiveMigration,
        step: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut failures = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && failures < self.config.max_retries => {
                    failures += 1;
                    let delay = retry_backoff_delay(&self.config, &marker.id, failures);
                    tracing::warn!(
                        id = %marker.id,
                        step,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = ?err,
                        "migration step failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Post-commit steps. Each is retried; returns whether all completed.
    async fn commit_cleanup(
        &self,
        marker: &ActiveMigration,
        version: ChunkVersion,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
        capture: Option<CaptureId>,
    ) -> bool {
        for node in [donor, recipient] {
            if let Err(err) = node.cache().refresh(&marker.ns, Some(version)).await {
                tracing::warn!(id = %marker.id, shard = %node.id(), error = ?err, "post-commit cache refresh failed");
            }
        }
        donor.exit_critical_section(&marker.ns, &marker.range);
        if let Some(capture) = capture {
            donor.stop_capture(capture);
        }
        let deleted = self
            .with_retry(marker, "donor range delete", || {
                donor.delete_range(&marker.ns, &marker.range)
            })
            .await;
        if let Err(err) = deleted {
            tracing::warn!(id = %marker.id, error = ?err, "donor range cleanup incomplete");
            return false;
        }
        self.release(marker)
    }

    async fn abort_cleanup(
        &self,
        marker: &ActiveMigration,
        donor: &Arc<ShardNode>,
        recipient: &Arc<ShardNode>,
        capture: Option<CaptureId>,
    ) -> bool {
        donor.exit_critical_section(&marker.ns, &marker.range);
        if let Some(capture) = capture {
            donor.stop_capture(capture);
        }
        let deleted = self
            .with_retry(marker, "recipient range delete", || {
                recipient.delete_range(&marker.ns, &marker.range)
            })
            .await;
        if let Err(err) = deleted {
            tracing::warn!(id = %marker.id, error = ?err, "recipient range cleanup incomplete");
            return false;
        }
        self.release(marker)
    }

    fn release(&self, marker: &ActiveMigration) -> bool {
        match self.catalog.apply(CatalogCommand::ReleaseMigration {
            id: marker.id.clone(),
        }) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(id = %marker.id, error = ?err, "failed to release migration marker");
                false
            }
        }
    }

    /// Request cancellation of the migration of the chunk containing `key`.
    /// Only honoured while the migration is still copying data.
    pub fn cancel(&self, ns: &Namespace, key: &KeyValue) -> Result<()> {
        let marker = self
            .catalog
            .read(|state| {
                state
                    .migrations
                    .values()
                    .find(|m| m.ns == *ns && m.range.contains(key))
                    .cloned()
            })
            .ok_or_else(|| {
                ShardingError::IllegalOperation(format!(
                    "no migration in progress for {key} in {ns}"
                ))
            })?;
        let mut running = self.running.lock().unwrap();
        let Some(cancel) = running.get_mut(&marker.id) else {
            return Err(ShardingError::IllegalOperation(format!(
                "migration {} is not running in this process",
                marker.id
            )));
        };
        if cancel.past_cancel_point || !marker.phase.is_cancellable() {
            return Err(ShardingError::IllegalOperation(format!(
                "migration {} can no longer be cancelled",
                marker.id
            )));
        }
        cancel.cancelled = true;
        tracing::info!(id = %marker.id, ns = %ns, "migration cancellation requested");
        Ok(())
    }

    /// Finish or roll back every migration left behind by a previous process,
    /// using only the durable markers and chunk ownership.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let markers = self.catalog.read(|state| {
            state
                .migrations
                .values()
                .map(|m| {
                    let owner = state
                        .chunks(&m.ns)
                        .iter()
                        .find(|c| c.range == m.range)
                        .map(|c| (c.shard.clone(), c.version));
                    (m.clone(), owner)
                })
                .collect::<Vec<_>>()
        });
        let mut report = RecoveryReport::default();
        for (marker, owner) in markers {
            if self.running.lock().unwrap().contains_key(&marker.id) {
                continue;
            }
            let donor = self.shards.get(&marker.from)?;
            let recipient = self.shards.get(&marker.to)?;
            let committed = marker.phase == MigrationPhase::Committed
                || owner.as_ref().map(|(shard, _)| shard == &marker.to).unwrap_or(false);
            if committed {
                let version = marker
                    .committed_version
                    .or(owner.map(|(_, version)| version))
                    .ok_or_else(|| {
                        ShardingError::Internal(format!(
                            "committed migration {} has no version",
                            marker.id
                        ))
                    })?;
                if self
                    .commit_cleanup(&marker, version, &donor, &recipient, None)
                    .await
                {
                    report.finished.push(marker.id.clone());
                }
            } else if self.abort_cleanup(&marker, &donor, &recipient, None).await {
                report.aborted.push(marker.id.clone());
            }
            tracing::info!(id = %marker.id, ns = %marker.ns, committed, "recovered migration");
        }
        Ok(report)
    }
}

pub(crate) fn apply_begin(state: &mut CatalogState, migration: ActiveMigration) -> Result<()> {
    let ns = migration.ns.clone();
    gate::ensure_allowed(state, &ns)?;
    state.ensure_not_resharding(&ns)?;
    if !state.shards.contains(&migration.to) {
        return Err(ShardingError::ShardNotFound(migration.to.clone()));
    }
    let current = state
        .chunks(&ns)
        .iter()
        .find(|c| c.range.min == migration.range.min)
        .ok_or_else(|| ShardingError::ChunkNotFound {
            ns: ns.clone(),
            key: migration.range.min.clone(),
        })?;
    if current.range != migration.range || current.shard != migration.from {
        return Err(ShardingError::ConflictingOperationInProgress(format!(
            "chunk {} of {ns} changed while the migration was being requested",
            migration.range
        )));
    }
    if let Some(existing) = state.migration_for_chunk(&ns, &migration.range.min) {
        return Err(ShardingError::ConflictingOperationInProgress(format!(
            "chunk {} of {ns} is already being migrated by {}",
            migration.range, existing.id
        )));
    }
    state.migrations.insert(migration.id.clone(), migration);
    Ok(())
}

pub(crate) fn apply_advance(
    state: &mut CatalogState,
    id: &str,
    phase: MigrationPhase,
) -> Result<()> {
    let marker = state
        .migrations
        .get_mut(id)
        .ok_or_else(|| ShardingError::IllegalOperation(format!("no active migration {id}")))?;
    if marker.phase == phase {
        return Ok(());
    }
    if marker.phase.is_terminal() || phase < marker.phase {
        return Err(ShardingError::IllegalOperation(format!(
            "migration {id} cannot move from {:?} to {phase:?}",
            marker.phase
        )));
    }
    marker.phase = phase;
    Ok(())
}

/// The commit point: reassign the chunk, bump versions, append history and
/// mark the migration committed, all in one catalog write. Replaying the
/// command for an already committed migration returns its version.
pub(crate) fn commit_transition(state: &mut CatalogState, id: &str) -> Result<ChunkVersion> {
    let marker = state
        .migrations
        .get(id)
        .cloned()
        .ok_or_else(|| ShardingError::IllegalOperation(format!("no active migration {id}")))?;
    if marker.phase == MigrationPhase::Committed {
        return marker.committed_version.ok_or_else(|| {
            ShardingError::Internal(format!("committed migration {id} has no version"))
        });
    }
    if marker.phase != MigrationPhase::CommitPending {
        return Err(ShardingError::IllegalOperation(format!(
            "migration {id} is in phase {:?}, not CommitPending",
            marker.phase
        )));
    }
    let ns = &marker.ns;
    if !state.collection(ns)?.allow_migrations() {
        return Err(gate::migrations_not_allowed(ns));
    }
    let idx = state
        .chunks(ns)
        .iter()
        .position(|c| c.range == marker.range && c.shard == marker.from)
        .ok_or_else(|| {
            ShardingError::ConflictingOperationInProgress(format!(
                "chunk {} of {ns} is no longer owned by {}",
                marker.range, marker.from
            ))
        })?;

    let tracks_history = state.feature_level.tracks_chunk_history();
    let commit_time = state.tick();
    let versions = state.collection_mut(ns)?.bump(VersionBump::Migration)?;
    let chunk = &mut state.chunks_mut(ns)?[idx];
    chunk.shard = marker.to.clone();
    chunk.version = versions[0];
    if tracks_history {
        history::record_ownership_change(chunk, &marker.to, commit_time);
    } else {
        // A pending removal may not have reached this chunk yet.
        chunk.history.clear();
        chunk.history_enabled = false;
    }
    if let Some(m) = state.migrations.get_mut(id) {
        m.phase = MigrationPhase::Committed;
        m.committed_version = Some(versions[0]);
    }
    Ok(versions[0])
}

/// Exponential backoff with deterministic jitter in `[80%, 120%]`, capped at
/// `retry_max`.
pub(crate) fn retry_backoff_delay(config: &MigrationConfig, salt: &str, failures: u32) -> Duration {
    use std::hash::{Hash, Hasher};

    let shift = failures.saturating_sub(1).min(16);
    let base_ms = config.retry_base.as_millis().min(u128::from(u64::MAX)) as u64;
    let raw_ms = base_ms.saturating_mul(1u64 << shift);
    let capped_ms = raw_ms.min(config.retry_max.as_millis().min(u128::from(u64::MAX)) as u64);

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    salt.hash(&mut hasher);
    failures.hash(&mut hasher);
    let jitter_percent = 80u64 + (hasher.finish() % 41);
    Duration::from_millis((capped_ms.saturating_mul(jitter_percent) / 100).max(1))
}
