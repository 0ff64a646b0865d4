//! Per-chunk ownership history.
//!
//! History is appended only when a migration commits and is what snapshot
//! reads use to answer "which shard owned key K at time T". Whether history is
//! kept at all follows the cluster feature level; transitions between levels
//! are applied by [`HistoryRewriteJob`] as one bulk rewrite per collection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogCommand, CatalogState, CatalogStore, ChunkType};
use crate::error::{Result, ShardingError};
use crate::types::{LogicalTime, Namespace, ShardId};
use crate::version::{ChunkVersion, VersionBump};

/// One ownership record: `shard` owned the chunk from `valid_after` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHistoryEntry {
    pub valid_after: LogicalTime,
    pub shard: ShardId,
}

/// Cluster compatibility level. Only `Latest` records chunk history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureLevel {
    LastStable,
    #[default]
    Latest,
}

impl FeatureLevel {
    pub fn tracks_chunk_history(self) -> bool {
        matches!(self, FeatureLevel::Latest)
    }
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureLevel::LastStable => f.write_str("last-stable"),
            FeatureLevel::Latest => f.write_str("latest"),
        }
    }
}

impl FromStr for FeatureLevel {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(FeatureLevel::Latest),
            "last-stable" | "last_stable" | "laststable" => Ok(FeatureLevel::LastStable),
            other => Err(ShardingError::InvalidOptions(format!(
                "unknown feature level '{other}'"
            ))),
        }
    }
}

/// Direction of a bulk history rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryRewrite {
    /// Give every chunk a history entry for its current owner and set the marker.
    Add,
    /// Strip history and marker from every chunk.
    Remove,
}

/// Append an ownership record for `new_shard`.
///
/// The effective timestamp is `valid_after` clamped to be strictly greater
/// than the newest recorded entry; it is returned to the caller.
pub fn record_ownership_change(
    chunk: &mut ChunkType,
    new_shard: &ShardId,
    valid_after: LogicalTime,
) -> LogicalTime {
    let valid_after = match chunk.history.last() {
        Some(last) if last.valid_after >= valid_after => last.valid_after.successor(),
        _ => valid_after,
    };
    chunk.history.push(ChunkHistoryEntry {
        valid_after,
        shard: new_shard.clone(),
    });
    chunk.history_enabled = true;
    valid_after
}

/// Shard that owned `chunk` at `at`.
pub fn owner_at(chunk: &ChunkType, at: LogicalTime) -> Result<ShardId> {
    chunk
        .history
        .iter()
        .rev()
        .find(|entry| entry.valid_after <= at)
        .map(|entry| entry.shard.clone())
        .ok_or_else(|| ShardingError::NoHistoryAvailable {
            ns: chunk.ns.clone(),
            at,
        })
}

pub(crate) fn check_chunk_history(chunk: &ChunkType) -> anyhow::Result<()> {
    for pair in chunk.history.windows(2) {
        anyhow::ensure!(
            pair[0].valid_after < pair[1].valid_after,
            "{} chunk {} history is not strictly increasing",
            chunk.ns,
            chunk.range
        );
    }
    if let Some(last) = chunk.history.last() {
        anyhow::ensure!(
            last.shard == chunk.shard,
            "{} chunk {} history ends on {} but is owned by {}",
            chunk.ns,
            chunk.range,
            last.shard,
            chunk.shard
        );
    }
    Ok(())
}

/// Whether every chunk's history and marker agree with `level`.
pub fn namespace_history_consistent(chunks: &[ChunkType], level: FeatureLevel) -> bool {
    if level.tracks_chunk_history() {
        chunks.iter().all(|c| {
            c.history_enabled
                && c.history.last().map(|e| &e.shard) == Some(&c.shard)
                && check_chunk_history(c).is_ok()
        })
    } else {
        chunks
            .iter()
            .all(|c| !c.history_enabled && c.history.is_empty())
    }
}

fn reset_history(chunk: &mut ChunkType, tracks_history: bool, now: LogicalTime) {
    if tracks_history {
        chunk.history = vec![ChunkHistoryEntry {
            valid_after: now,
            shard: chunk.shard.clone(),
        }];
        chunk.history_enabled = true;
    } else {
        chunk.history.clear();
        chunk.history_enabled = false;
    }
}

/// Bring one collection's chunks in line with `mode`. Chunks already in the
/// target shape are left alone; the collection version is bumped once if any
/// chunk changed.
pub(crate) fn rewrite_collection_history(
    state: &mut CatalogState,
    ns: &Namespace,
    mode: HistoryRewrite,
) -> Result<Option<ChunkVersion>> {
    state.collection(ns)?;
    let now = state.tick();
    let mut touched = 0usize;
    for chunk in state.chunks_mut(ns)?.iter_mut() {
        match mode {
            HistoryRewrite::Add => {
                if !chunk.history_enabled || chunk.history.is_empty() {
                    reset_history(chunk, true, now);
                    touched += 1;
                }
            }
            HistoryRewrite::Remove => {
                if chunk.history_enabled || !chunk.history.is_empty() {
                    reset_history(chunk, false, now);
                    touched += 1;
                }
            }
        }
    }
    if touched == 0 {
        return Ok(None);
    }
    let coll = state.collection_mut(ns)?;
    coll.bump(VersionBump::CollectionOnly)?;
    Ok(Some(coll.version))
}

/// Rewrite every chunk of an inconsistent namespace from current ownership.
/// Consistent namespaces are untouched.
pub(crate) fn repair_namespace(
    state: &mut CatalogState,
    ns: &Namespace,
) -> Result<Option<ChunkVersion>> {
    state.collection(ns)?;
    let level = state.feature_level;
    if namespace_history_consistent(state.chunks(ns), level) {
        return Ok(None);
    }
    let now = state.tick();
    for chunk in state.chunks_mut(ns)?.iter_mut() {
        reset_history(chunk, level.tracks_chunk_history(), now);
    }
    let coll = state.collection_mut(ns)?;
    coll.bump(VersionBump::CollectionOnly)?;
    Ok(Some(coll.version))
}

/// Result of one bulk rewrite pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRewriteReport {
    pub mode: Option<HistoryRewrite>,
    /// Collections whose chunks changed (and whose version was bumped).
    pub rewritten: Vec<Namespace>,
}

/// Drains the rewrite owed after a feature-level transition.
///
/// The pending rewrite is stored in the catalog, so a job interrupted halfway
/// is resumed by simply running it again; collections already rewritten are
/// skipped because the per-collection rewrite is a no-op for them.
#[derive(Clone)]
pub struct HistoryRewriteJob {
    catalog: CatalogStore,
}

impl HistoryRewriteJob {
    pub fn new(catalog: CatalogStore) -> Self {
        Self { catalog }
    }

    pub fn run(&self) -> Result<HistoryRewriteReport> {
        let Some(mode) = self.catalog.read(|state| state.pending_history_rewrite) else {
            return Ok(HistoryRewriteReport::default());
        };
        let namespaces = self.catalog.read(|state| {
            state
                .collections
                .values()
                .map(|c| c.ns.clone())
                .collect::<Vec<_>>()
        });
        let mut report = HistoryRewriteReport {
            mode: Some(mode),
            rewritten: Vec::new(),
        };
        for ns in namespaces {
            match self
                .catalog
                .apply(CatalogCommand::RewriteCollectionHistory {
                    ns: ns.clone(),
                    mode,
                }) {
                Ok(Some(version)) => {
                    tracing::debug!(ns = %ns, version = %version, ?mode, "rewrote chunk history");
                    report.rewritten.push(ns);
                }
                Ok(None) => {}
                // Dropped since the list was taken.
                Err(ShardingError::NamespaceNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.catalog.apply(CatalogCommand::CompleteHistoryRewrite)?;
        tracing::info!(
            ?mode,
            collections = report.rewritten.len(),
            "chunk history rewrite complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sharded_store;
    use crate::types::{ChunkRange, KeyValue};

    fn ts(secs: u64) -> LogicalTime {
        LogicalTime::new(secs, 1)
    }

    #[test]
    fn owner_at_resolves_greatest_entry_not_after_time() {
        let (store, ns) = sharded_store("test.hist", &["shard0", "shard1"]);
        let mut chunk = store.state().chunks(&ns)[0].clone();
        chunk.history = vec![ChunkHistoryEntry {
            valid_after: ts(10),
            shard: ShardId::from("shard0"),
        }];
        record_ownership_change(&mut chunk, &ShardId::from("shard1"), ts(20));
        chunk.shard = ShardId::from("shard1");

        assert_eq!(owner_at(&chunk, ts(10)).expect("owner"), ShardId::from("shard0"));
        assert_eq!(owner_at(&chunk, ts(15)).expect("owner"), ShardId::from("shard0"));
        assert_eq!(owner_at(&chunk, ts(25)).expect("owner"), ShardId::from("shard1"));
        let err = owner_at(&chunk, ts(5)).expect_err("before history");
        assert!(matches!(err, ShardingError::NoHistoryAvailable { .. }));

        chunk.history.clear();
        assert!(owner_at(&chunk, ts(25)).is_err());
    }

    #[test]
    fn record_clamps_to_strictly_increasing_timestamps() {
        let (store, ns) = sharded_store("test.hist", &["shard0", "shard1"]);
        let mut chunk = store.state().chunks(&ns)[0].clone();
        let last = chunk.history.last().expect("initial history").valid_after;
        let applied = record_ownership_change(&mut chunk, &ShardId::from("shard1"), last);
        assert!(applied > last);
        chunk.shard = ShardId::from("shard1");
        check_chunk_history(&chunk).expect("ordered");
    }

    #[test]
    fn rewrite_remove_then_add_is_idempotent() {
        let (store, ns) = sharded_store("test.hist", &["shard0"]);
        store
            .apply(CatalogCommand::SplitChunk {
                ns: ns.clone(),
                at: KeyValue::Int(0),
            })
            .expect("split");

        let removed = store
            .apply(CatalogCommand::RewriteCollectionHistory {
                ns: ns.clone(),
                mode: HistoryRewrite::Remove,
            })
            .expect("remove");
        assert!(removed.is_some());
        assert!(store
            .state()
            .chunks(&ns)
            .iter()
            .all(|c| c.history.is_empty() && !c.history_enabled));
        let again = store
            .apply(CatalogCommand::RewriteCollectionHistory {
                ns: ns.clone(),
                mode: HistoryRewrite::Remove,
            })
            .expect("remove again");
        assert!(again.is_none());

        store
            .apply(CatalogCommand::RewriteCollectionHistory {
                ns: ns.clone(),
                mode: HistoryRewrite::Add,
            })
            .expect("add");
        let state = store.state();
        assert!(namespace_history_consistent(state.chunks(&ns), FeatureLevel::Latest));
    }

    #[test]
    fn repair_fixes_partial_history_once() {
        let (store, ns) = sharded_store("test.repair", &["shard0"]);
        for at in [0, 10, 20] {
            store
                .apply(CatalogCommand::SplitChunk {
                    ns: ns.clone(),
                    at: KeyValue::Int(at),
                })
                .expect("split");
        }
        store
            .apply(CatalogCommand::RewriteCollectionHistory {
                ns: ns.clone(),
                mode: HistoryRewrite::Remove,
            })
            .expect("strip");
        // A merge under the history feature leaves one chunk with history
        // while its siblings have none.
        store
            .apply(CatalogCommand::MergeChunks {
                ns: ns.clone(),
                range: ChunkRange::new(KeyValue::Int(10), KeyValue::MaxKey).expect("range"),
            })
            .expect("merge");
        let partial = store.state();
        assert!(partial.chunks(&ns).iter().any(|c| c.history_enabled));
        assert!(!namespace_history_consistent(
            partial.chunks(&ns),
            FeatureLevel::Latest
        ));

        let first = store
            .apply(CatalogCommand::RepairChunksHistory { ns: ns.clone() })
            .expect("repair");
        assert!(first.is_some());
        let state = store.state();
        assert!(namespace_history_consistent(state.chunks(&ns), FeatureLevel::Latest));
        state.check_invariants().expect("invariants");

        let second = store
            .apply(CatalogCommand::RepairChunksHistory { ns: ns.clone() })
            .expect("repair again");
        assert!(second.is_none());
        assert_eq!(state.chunks(&ns), store.state().chunks(&ns));
    }

    #[test]
    fn rewrite_job_follows_feature_level_transitions() {
        let (store, ns) = sharded_store("test.fcv", &["shard0"]);
        let job = HistoryRewriteJob::new(store.clone());
        assert_eq!(job.run().expect("idle run"), HistoryRewriteReport::default());

        store
            .apply(CatalogCommand::SetFeatureLevel {
                level: FeatureLevel::LastStable,
            })
            .expect("downgrade");
        let report = job.run().expect("remove run");
        assert_eq!(report.mode, Some(HistoryRewrite::Remove));
        assert_eq!(report.rewritten, vec![ns.clone()]);
        let state = store.state();
        assert!(state.pending_history_rewrite.is_none());
        assert!(namespace_history_consistent(
            state.chunks(&ns),
            FeatureLevel::LastStable
        ));

        store
            .apply(CatalogCommand::SetFeatureLevel {
                level: FeatureLevel::Latest,
            })
            .expect("upgrade");
        job.run().expect("add run");
        assert!(namespace_history_consistent(
            store.state().chunks(&ns),
            FeatureLevel::Latest
        ));
    }

    #[test]
    fn feature_level_parses_cli_spellings() {
        assert_eq!("latest".parse::<FeatureLevel>().expect("level"), FeatureLevel::Latest);
        assert_eq!(
            "last-stable".parse::<FeatureLevel>().expect("level"),
            FeatureLevel::LastStable
        );
        assert!("4.0".parse::<FeatureLevel>().is_err());
    }
}
