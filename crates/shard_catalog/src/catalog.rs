//! Authoritative collection and chunk metadata.
//!
//! `CatalogStore` owns one `CatalogState` behind a lock. Every mutation is a
//! `CatalogCommand` applied to a working copy, persisted, and only then
//! installed, so readers observe either the whole write or none of it. This is
//! the linearizable single-document transaction every version bump, gate
//! toggle and migration commit relies on.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ShardingError};
use crate::history::{self, ChunkHistoryEntry, FeatureLevel, HistoryRewrite};
use crate::types::{
    unix_time_secs, ChunkRange, KeyValue, LogicalTime, Namespace, ShardId, ShardKeyPattern,
};
use crate::version::{self, ChunkVersion, VersionBump};

/// Collection entry (`config.collections`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionType {
    pub ns: Namespace,
    pub uuid: Uuid,
    pub key_pattern: ShardKeyPattern,
    pub epoch: Uuid,
    pub timestamp: LogicalTime,
    pub version: ChunkVersion,
    pub primary_shard: ShardId,
    /// Absent means migrations are allowed; only an explicit `false` is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_migrations: Option<bool>,
    #[serde(default)]
    pub unsplittable: bool,
    #[serde(default)]
    pub no_balance: bool,
}

impl CollectionType {
    pub fn allow_migrations(&self) -> bool {
        self.allow_migrations.unwrap_or(true)
    }

    /// Apply a version bump to the collection and return the chunk versions
    /// the write must stamp.
    pub(crate) fn bump(&mut self, kind: VersionBump) -> Result<Vec<ChunkVersion>> {
        let (next, chunk_versions) = version::bump(self.version, kind)?;
        self.version = next;
        Ok(chunk_versions)
    }
}

/// Chunk entry (`config.chunks`), keyed by `(ns, range.min)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkType {
    pub ns: Namespace,
    pub uuid: Uuid,
    pub range: ChunkRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    /// Ownership records, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ChunkHistoryEntry>,
    /// Marker that `history` was populated under the history feature.
    #[serde(default)]
    pub history_enabled: bool,
    #[serde(default)]
    pub jumbo: bool,
}

/// Durable phase of an in-flight chunk migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MigrationPhase {
    Requested,
    Cloning,
    Catchup,
    CommitPending,
    Committed,
    Aborted,
}

impl MigrationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Committed | MigrationPhase::Aborted)
    }

    /// Operator cancellation is only honoured while data is being copied.
    pub fn is_cancellable(self) -> bool {
        matches!(self, MigrationPhase::Cloning | MigrationPhase::Catchup)
    }
}

/// Durable per-chunk migration marker. Its presence is the mutual-exclusion
/// lock for the chunk; its contents are all crash recovery needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveMigration {
    pub id: String,
    pub ns: Namespace,
    pub range: ChunkRange,
    pub from: ShardId,
    pub to: ShardId,
    pub phase: MigrationPhase,
    pub started_unix_ms: u64,
    #[serde(default)]
    pub committed_version: Option<ChunkVersion>,
}

/// Durable marker of an in-flight reshard. While present, chunk migrations,
/// splits, merges and drops of the namespace are refused; after a crash it
/// tells recovery which key pattern and epoch the operation was heading for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshardOperation {
    pub ns: Namespace,
    pub epoch: Uuid,
    pub key_pattern: ShardKeyPattern,
    pub previous_key_pattern: ShardKeyPattern,
    pub primary: ShardId,
}

/// Cluster-wide sharding metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogState {
    #[serde(default)]
    pub feature_level: FeatureLevel,
    /// Bulk history rewrite still owed after a feature-level transition.
    #[serde(default)]
    pub pending_history_rewrite: Option<HistoryRewrite>,
    #[serde(default)]
    pub cluster_time: LogicalTime,
    #[serde(default)]
    pub shards: BTreeSet<ShardId>,
    pub collections: BTreeMap<String, CollectionType>,
    /// Chunks per namespace, sorted by `range.min`.
    pub chunks: BTreeMap<String, Vec<ChunkType>>,
    /// In-flight migrations keyed by migration id.
    #[serde(default)]
    pub migrations: BTreeMap<String, ActiveMigration>,
    /// In-flight reshards keyed by namespace.
    #[serde(default)]
    pub reshards: BTreeMap<String, ReshardOperation>,
}

/// Commands applied to the catalog. Each is one atomic write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatalogCommand {
    AddShard {
        shard: ShardId,
    },
    ShardCollection {
        ns: Namespace,
        uuid: Uuid,
        epoch: Uuid,
        key_pattern: ShardKeyPattern,
        primary: ShardId,
        unsplittable: bool,
    },
    DropCollection {
        ns: Namespace,
    },
    /// Redefine the shard key. Starts a new epoch with a single chunk on the
    /// primary shard; the collection uuid is kept.
    ReshardCollection {
        ns: Namespace,
        key_pattern: ShardKeyPattern,
        epoch: Uuid,
    },
    BeginReshard {
        operation: ReshardOperation,
    },
    EndReshard {
        ns: Namespace,
    },
    SplitChunk {
        ns: Namespace,
        at: KeyValue,
    },
    MergeChunks {
        ns: Namespace,
        range: ChunkRange,
    },
    SetAllowMigrations {
        ns: Namespace,
        allowed: bool,
        expected_uuid: Option<Uuid>,
    },
    SetNoBalance {
        ns: Namespace,
        no_balance: bool,
    },
    MarkJumbo {
        ns: Namespace,
        min: KeyValue,
    },
    BeginMigration {
        migration: ActiveMigration,
    },
    AdvanceMigration {
        id: String,
        phase: MigrationPhase,
    },
    CommitMigration {
        id: String,
    },
    ReleaseMigration {
        id: String,
    },
    SetFeatureLevel {
        level: FeatureLevel,
    },
    RewriteCollectionHistory {
        ns: Namespace,
        mode: HistoryRewrite,
    },
    CompleteHistoryRewrite,
    RepairChunksHistory {
        ns: Namespace,
    },
}

impl CatalogState {
    /// Advance and return the catalog's logical clock.
    pub(crate) fn tick(&mut self) -> LogicalTime {
        self.cluster_time = self.cluster_time.advance(unix_time_secs());
        self.cluster_time
    }

    pub fn collection(&self, ns: &Namespace) -> Result<&CollectionType> {
        self.collections
            .get(ns.as_str())
            .ok_or_else(|| ShardingError::NamespaceNotFound(ns.clone()))
    }

    pub(crate) fn collection_mut(&mut self, ns: &Namespace) -> Result<&mut CollectionType> {
        self.collections
            .get_mut(ns.as_str())
            .ok_or_else(|| ShardingError::NamespaceNotFound(ns.clone()))
    }

    pub fn chunks(&self, ns: &Namespace) -> &[ChunkType] {
        self.chunks
            .get(ns.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn chunks_mut(&mut self, ns: &Namespace) -> Result<&mut Vec<ChunkType>> {
        self.chunks
            .get_mut(ns.as_str())
            .ok_or_else(|| ShardingError::NamespaceNotFound(ns.clone()))
    }

    pub fn chunk_for_key(&self, ns: &Namespace, key: &KeyValue) -> Result<&ChunkType> {
        self.collection(ns)?;
        self.chunks(ns)
            .iter()
            .find(|c| c.range.contains(key))
            .ok_or_else(|| ShardingError::ChunkNotFound {
                ns: ns.clone(),
                key: key.clone(),
            })
    }

    pub fn migration_for_chunk(&self, ns: &Namespace, min: &KeyValue) -> Option<&ActiveMigration> {
        self.migrations
            .values()
            .find(|m| m.ns == *ns && m.range.min == *min)
    }

    pub fn reshard_in_progress(&self, ns: &Namespace) -> bool {
        self.reshards.contains_key(ns.as_str())
    }

    pub(crate) fn ensure_not_resharding(&self, ns: &Namespace) -> Result<()> {
        if self.reshard_in_progress(ns) {
            return Err(ShardingError::ConflictingOperationInProgress(format!(
                "{ns} is being resharded"
            )));
        }
        Ok(())
    }

    fn has_migration_overlapping(&self, ns: &Namespace, range: &ChunkRange) -> bool {
        self.migrations
            .values()
            .any(|m| m.ns == *ns && m.range.min < range.max && range.min < m.range.max)
    }

    /// Chunk count per shard for one namespace, including registered shards
    /// that own nothing.
    pub fn chunk_counts(&self, ns: &Namespace) -> BTreeMap<ShardId, usize> {
        let mut counts = self
            .shards
            .iter()
            .cloned()
            .map(|s| (s, 0usize))
            .collect::<BTreeMap<_, _>>();
        for chunk in self.chunks(ns) {
            *counts.entry(chunk.shard.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Validate the structural invariants of every namespace.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        for (ns, coll) in &self.collections {
            let chunks = self.chunks.get(ns).map(Vec::as_slice).unwrap_or(&[]);
            anyhow::ensure!(!chunks.is_empty(), "{ns} has no chunks");
            anyhow::ensure!(
                chunks[0].range.min == KeyValue::MinKey,
                "{ns} first chunk does not start at MinKey"
            );
            anyhow::ensure!(
                chunks[chunks.len() - 1].range.max == KeyValue::MaxKey,
                "{ns} last chunk does not end at MaxKey"
            );
            for pair in chunks.windows(2) {
                anyhow::ensure!(
                    pair[0].range.max == pair[1].range.min,
                    "{ns} chunks {} and {} leave a gap or overlap",
                    pair[0].range,
                    pair[1].range
                );
            }
            for chunk in chunks {
                anyhow::ensure!(
                    chunk.version.is_same_epoch(&coll.version),
                    "{ns} chunk {} has a foreign epoch",
                    chunk.range
                );
                anyhow::ensure!(
                    !coll.version.is_older_than(&chunk.version),
                    "{ns} chunk {} is newer than its collection",
                    chunk.range
                );
                history::check_chunk_history(chunk)?;
            }
        }
        Ok(())
    }
}

/// Shared catalog handle with optional JSON persistence.
#[derive(Clone)]
pub struct CatalogStore {
    state: Arc<RwLock<CatalogState>>,
    path: Option<PathBuf>,
}

impl CatalogStore {
    /// Volatile catalog for tests and embedded use.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(CatalogState::default())),
            path: None,
        }
    }

    /// Open the catalog persisted at `path`, creating an empty one if absent.
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<CatalogState>(&data)
                .with_context(|| format!("decode catalog state {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("read catalog state {}", path.display()))
            }
        };
        let store = Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        };
        store.persist(&store.state())?;
        Ok(store)
    }

    pub fn state(&self) -> CatalogState {
        self.state.read().unwrap().clone()
    }

    /// Run `f` against the current state without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&CatalogState) -> R) -> R {
        f(&self.state.read().unwrap())
    }

    pub fn collection(&self, ns: &Namespace) -> Result<CollectionType> {
        self.read(|state| state.collection(ns).cloned())
    }

    /// Consistent snapshot of one namespace's collection entry and chunks.
    pub fn collection_and_chunks(
        &self,
        ns: &Namespace,
    ) -> Result<(CollectionType, Vec<ChunkType>)> {
        self.read(|state| {
            let coll = state.collection(ns)?.clone();
            Ok((coll, state.chunks(ns).to_vec()))
        })
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.read(|state| state.feature_level)
    }

    /// Apply one command atomically. Returns the new collection version when
    /// the write bumped one.
    pub fn apply(&self, cmd: CatalogCommand) -> Result<Option<ChunkVersion>> {
        let mut guard = self.state.write().unwrap();
        let mut next = guard.clone();
        let outcome = apply_command(&mut next, cmd)?;
        self.persist(&next)?;
        *guard = next;
        Ok(outcome)
    }

    fn persist(&self, state: &CatalogState) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create catalog dir")?;
        }
        let data = serde_json::to_vec_pretty(state).context("serialize catalog state")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).context("write catalog state")?;
        fs::rename(&tmp, path).context("install catalog state")?;
        Ok(())
    }
}

fn apply_command(state: &mut CatalogState, cmd: CatalogCommand) -> Result<Option<ChunkVersion>> {
    match cmd {
        CatalogCommand::AddShard { shard } => {
            state.shards.insert(shard);
            Ok(None)
        }
        CatalogCommand::ShardCollection {
            ns,
            uuid,
            epoch,
            key_pattern,
            primary,
            unsplittable,
        } => apply_shard_collection(state, ns, uuid, epoch, key_pattern, primary, unsplittable),
        CatalogCommand::DropCollection { ns } => {
            state.collection(&ns)?;
            state.ensure_not_resharding(&ns)?;
            if state.migrations.values().any(|m| m.ns == ns) {
                return Err(ShardingError::ConflictingOperationInProgress(format!(
                    "cannot drop {ns} while a chunk migration is in progress"
                )));
            }
            state.collections.remove(ns.as_str());
            state.chunks.remove(ns.as_str());
            Ok(None)
        }
        CatalogCommand::ReshardCollection {
            ns,
            key_pattern,
            epoch,
        } => {
            let coll = state.collection(&ns)?.clone();
            if state.migrations.values().any(|m| m.ns == ns) {
                return Err(ShardingError::ConflictingOperationInProgress(format!(
                    "cannot reshard {ns} while a chunk migration is in progress"
                )));
            }
            state.collections.remove(ns.as_str());
            state.chunks.remove(ns.as_str());
            let version = apply_shard_collection(
                state,
                ns.clone(),
                coll.uuid,
                epoch,
                key_pattern,
                coll.primary_shard,
                coll.unsplittable,
            )?;
            let resharded = state.collection_mut(&ns)?;
            resharded.allow_migrations = coll.allow_migrations;
            resharded.no_balance = coll.no_balance;
            Ok(version)
        }
        CatalogCommand::BeginReshard { operation } => {
            let ns = operation.ns.clone();
            state.collection(&ns)?;
            state.ensure_not_resharding(&ns)?;
            if state.migrations.values().any(|m| m.ns == ns) {
                return Err(ShardingError::ConflictingOperationInProgress(format!(
                    "cannot reshard {ns} while a chunk migration is in progress"
                )));
            }
            state.reshards.insert(ns.as_str().to_string(), operation);
            Ok(None)
        }
        CatalogCommand::EndReshard { ns } => {
            state.reshards.remove(ns.as_str());
            Ok(None)
        }
        CatalogCommand::SplitChunk { ns, at } => apply_split_chunk(state, &ns, at),
        CatalogCommand::MergeChunks { ns, range } => apply_merge_chunks(state, &ns, range),
        CatalogCommand::SetAllowMigrations {
            ns,
            allowed,
            expected_uuid,
        } => crate::gate::apply_set_allow_migrations(state, &ns, allowed, expected_uuid).map(Some),
        CatalogCommand::SetNoBalance { ns, no_balance } => {
            let coll = state.collection_mut(&ns)?;
            coll.no_balance = no_balance;
            coll.bump(VersionBump::CollectionOnly)?;
            Ok(Some(coll.version))
        }
        CatalogCommand::MarkJumbo { ns, min } => {
            let chunk = state
                .chunks_mut(&ns)?
                .iter_mut()
                .find(|c| c.range.min == min)
                .ok_or_else(|| ShardingError::ChunkNotFound {
                    ns: ns.clone(),
                    key: min.clone(),
                })?;
            chunk.jumbo = true;
            Ok(None)
        }
        CatalogCommand::BeginMigration { migration } => {
            crate::migration::apply_begin(state, migration).map(|_| None)
        }
        CatalogCommand::AdvanceMigration { id, phase } => {
            crate::migration::apply_advance(state, &id, phase).map(|_| None)
        }
        CatalogCommand::CommitMigration { id } => {
            crate::migration::commit_transition(state, &id).map(Some)
        }
        CatalogCommand::ReleaseMigration { id } => {
            state.migrations.remove(&id);
            Ok(None)
        }
        CatalogCommand::SetFeatureLevel { level } => {
            if state.feature_level != level {
                state.feature_level = level;
                state.pending_history_rewrite = Some(if level.tracks_chunk_history() {
                    HistoryRewrite::Add
                } else {
                    HistoryRewrite::Remove
                });
            }
            Ok(None)
        }
        CatalogCommand::RewriteCollectionHistory { ns, mode } => {
            history::rewrite_collection_history(state, &ns, mode)
        }
        CatalogCommand::CompleteHistoryRewrite => {
            state.pending_history_rewrite = None;
            Ok(None)
        }
        CatalogCommand::RepairChunksHistory { ns } => history::repair_namespace(state, &ns),
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_shard_collection(
    state: &mut CatalogState,
    ns: Namespace,
    uuid: Uuid,
    epoch: Uuid,
    key_pattern: ShardKeyPattern,
    primary: ShardId,
    unsplittable: bool,
) -> Result<Option<ChunkVersion>> {
    if state.collections.contains_key(ns.as_str()) {
        return Err(ShardingError::NamespaceExists(ns));
    }
    if !state.shards.contains(&primary) {
        return Err(ShardingError::ShardNotFound(primary));
    }
    let timestamp = state.tick();
    let version = ChunkVersion::initial(epoch, timestamp);
    let tracks_history = state.feature_level.tracks_chunk_history();
    let chunk = ChunkType {
        ns: ns.clone(),
        uuid,
        range: ChunkRange::full(),
        shard: primary.clone(),
        version,
        history: if tracks_history {
            vec![ChunkHistoryEntry {
                valid_after: timestamp,
                shard: primary.clone(),
            }]
        } else {
            Vec::new()
        },
        history_enabled: tracks_history,
        jumbo: false,
    };
    state.collections.insert(
        ns.as_str().to_string(),
        CollectionType {
            ns: ns.clone(),
            uuid,
            key_pattern,
            epoch,
            timestamp,
            version,
            primary_shard: primary,
            allow_migrations: None,
            unsplittable,
            no_balance: false,
        },
    );
    state.chunks.insert(ns.as_str().to_string(), vec![chunk]);
    Ok(Some(version))
}

fn apply_split_chunk(
    state: &mut CatalogState,
    ns: &Namespace,
    at: KeyValue,
) -> Result<Option<ChunkVersion>> {
    state.ensure_not_resharding(ns)?;
    if state.collection(ns)?.unsplittable {
        return Err(ShardingError::IllegalOperation(format!(
            "cannot split unsplittable collection {ns}"
        )));
    }
    if at.is_bound_only() {
        return Err(ShardingError::InvalidOptions(format!(
            "cannot split {ns} at {at}"
        )));
    }
    let idx = state
        .chunks(ns)
        .iter()
        .position(|c| c.range.contains(&at))
        .ok_or_else(|| ShardingError::ChunkNotFound {
            ns: ns.clone(),
            key: at.clone(),
        })?;
    let source = state.chunks(ns)[idx].clone();
    if source.range.min == at {
        // Already a chunk boundary.
        return Ok(None);
    }
    if state.migration_for_chunk(ns, &source.range.min).is_some() {
        return Err(ShardingError::ConflictingOperationInProgress(format!(
            "chunk {} of {ns} is being migrated",
            source.range
        )));
    }

    let versions = state.collection_mut(ns)?.bump(VersionBump::Split { pieces: 2 })?;
    let mut left = source.clone();
    left.range = ChunkRange {
        min: source.range.min.clone(),
        max: at.clone(),
    };
    left.version = versions[0];
    left.jumbo = false;
    let mut right = source;
    right.range.min = at;
    right.version = versions[1];
    right.jumbo = false;

    let chunks = state.chunks_mut(ns)?;
    chunks[idx] = left;
    chunks.insert(idx + 1, right);
    Ok(Some(versions[1]))
}

fn apply_merge_chunks(
    state: &mut CatalogState,
    ns: &Namespace,
    range: ChunkRange,
) -> Result<Option<ChunkVersion>> {
    state.collection(ns)?;
    state.ensure_not_resharding(ns)?;
    let chunks = state.chunks(ns);
    let first = chunks
        .iter()
        .position(|c| c.range.min == range.min)
        .ok_or_else(|| {
            ShardingError::IllegalOperation(format!(
                "merge range {range} does not start on a chunk boundary of {ns}"
            ))
        })?;
    let last = chunks
        .iter()
        .position(|c| c.range.max == range.max)
        .ok_or_else(|| {
            ShardingError::IllegalOperation(format!(
                "merge range {range} does not end on a chunk boundary of {ns}"
            ))
        })?;
    if last <= first {
        return Err(ShardingError::IllegalOperation(format!(
            "merge range {range} of {ns} must span at least two chunks"
        )));
    }
    let shard = chunks[first].shard.clone();
    if chunks[first..=last].iter().any(|c| c.shard != shard) {
        return Err(ShardingError::IllegalOperation(format!(
            "chunks in {range} of {ns} are not all owned by {shard}"
        )));
    }
    if state.has_migration_overlapping(ns, &range) {
        return Err(ShardingError::ConflictingOperationInProgress(format!(
            "a chunk in {range} of {ns} is being migrated"
        )));
    }

    let tracks_history = state.feature_level.tracks_chunk_history();
    let merged_at = state.tick();
    let versions = state.collection_mut(ns)?.bump(VersionBump::Merge)?;
    let chunks = state.chunks_mut(ns)?;
    let mut merged = chunks[first].clone();
    merged.range = range;
    merged.version = versions[0];
    merged.jumbo = false;
    merged.history_enabled = tracks_history;
    merged.history = if tracks_history {
        vec![ChunkHistoryEntry {
            valid_after: merged_at,
            shard,
        }]
    } else {
        Vec::new()
    };
    chunks.splice(first..=last, [merged]);
    Ok(Some(versions[0]))
}
