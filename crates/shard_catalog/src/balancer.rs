//! Background chunk balancer.
//!
//! Each round plans at most one migration per collection, from the shard with
//! the most chunks to the shard with the fewest, and never more than one
//! migration per (donor, recipient) pair, counting migrations already in
//! flight. Planned migrations of a round run concurrently. Collections whose
//! migration gate is closed or that opted out of balancing are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;

use crate::catalog::{CatalogState, CatalogStore};
use crate::error::{Result, ShardingError};
use crate::migration::{MigrationCoordinator, MigrationOutcome, MoveChunkRequest};
use crate::types::{ChunkRange, Namespace, ShardId};

#[derive(Clone, Copy, Debug)]
pub struct BalancerConfig {
    /// Delay between rounds of the background loop.
    pub interval: Duration,
    /// A collection is imbalanced when the most and least loaded shards differ
    /// by more than this many chunks.
    pub imbalance_threshold: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            imbalance_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ComplianceViolation {
    ChunksImbalance,
}

impl fmt::Display for ComplianceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplianceViolation::ChunksImbalance => f.write_str("chunksImbalance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionBalanceStatus {
    pub balancer_compliant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_compliance_violation: Option<ComplianceViolation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MigrationsNotAllowed,
    NoBalance,
    /// Imbalanced, but every candidate chunk is jumbo or already migrating.
    NoEligibleChunk,
    /// The donor/recipient pair already has a migration in flight.
    PairBusy,
    ReshardInProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMigration {
    pub ns: Namespace,
    pub range: ChunkRange,
    pub from: ShardId,
    pub to: ShardId,
}

#[derive(Debug, Default)]
pub struct RoundReport {
    pub planned: Vec<PlannedMigration>,
    pub skipped: Vec<(Namespace, SkipReason)>,
    pub succeeded: Vec<MigrationOutcome>,
    pub failed: Vec<(PlannedMigration, ShardingError)>,
}

/// Imbalance of `ns` regardless of its gate or balancing settings.
pub fn collection_status(
    state: &CatalogState,
    ns: &Namespace,
    threshold: usize,
) -> Result<CollectionBalanceStatus> {
    state.collection(ns)?;
    let counts = state.chunk_counts(ns);
    let spread = match (max_count(&counts), min_count(&counts)) {
        (Some((_, most)), Some((_, least))) => most - least,
        _ => 0,
    };
    if spread > threshold {
        Ok(CollectionBalanceStatus {
            balancer_compliant: false,
            first_compliance_violation: Some(ComplianceViolation::ChunksImbalance),
        })
    } else {
        Ok(CollectionBalanceStatus {
            balancer_compliant: true,
            first_compliance_violation: None,
        })
    }
}

/// Plan one balancing round.
pub fn plan_round(
    state: &CatalogState,
    threshold: usize,
) -> (Vec<PlannedMigration>, Vec<(Namespace, SkipReason)>) {
    let mut busy_pairs = state
        .migrations
        .values()
        .map(|m| shard_pair(&m.from, &m.to))
        .collect::<BTreeSet<_>>();
    let mut planned = Vec::new();
    let mut skipped = Vec::new();

    for coll in state.collections.values() {
        let ns = &coll.ns;
        if !coll.allow_migrations() {
            skipped.push((ns.clone(), SkipReason::MigrationsNotAllowed));
            continue;
        }
        if coll.no_balance {
            skipped.push((ns.clone(), SkipReason::NoBalance));
            continue;
        }
        if state.reshard_in_progress(ns) {
            skipped.push((ns.clone(), SkipReason::ReshardInProgress));
            continue;
        }
        let counts = state.chunk_counts(ns);
        let (Some((donor, most)), Some((recipient, least))) =
            (max_count(&counts), min_count(&counts))
        else {
            continue;
        };
        if most - least <= threshold {
            continue;
        }
        let pair = shard_pair(&donor, &recipient);
        if busy_pairs.contains(&pair) {
            skipped.push((ns.clone(), SkipReason::PairBusy));
            continue;
        }
        let candidate = state.chunks(ns).iter().find(|c| {
            c.shard == donor && !c.jumbo && state.migration_for_chunk(ns, &c.range.min).is_none()
        });
        let Some(chunk) = candidate else {
            skipped.push((ns.clone(), SkipReason::NoEligibleChunk));
            continue;
        };
        busy_pairs.insert(pair);
        planned.push(PlannedMigration {
            ns: ns.clone(),
            range: chunk.range.clone(),
            from: donor,
            to: recipient,
        });
    }
    (planned, skipped)
}

/// Unordered shard pair; a migration in either direction occupies it.
fn shard_pair(a: &ShardId, b: &ShardId) -> (ShardId, ShardId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn max_count(counts: &BTreeMap<ShardId, usize>) -> Option<(ShardId, usize)> {
    counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(id, count)| (id.clone(), *count))
}

fn min_count(counts: &BTreeMap<ShardId, usize>) -> Option<(ShardId, usize)> {
    counts
        .iter()
        .min_by_key(|(_, count)| **count)
        .map(|(id, count)| (id.clone(), *count))
}

pub struct Balancer {
    catalog: CatalogStore,
    coordinator: Arc<MigrationCoordinator>,
    config: BalancerConfig,
    enabled: AtomicBool,
}

impl Balancer {
    pub fn new(
        catalog: CatalogStore,
        coordinator: Arc<MigrationCoordinator>,
        config: BalancerConfig,
    ) -> Self {
        Self {
            catalog,
            coordinator,
            config,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> BalancerConfig {
        self.config
    }

    pub fn start(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("balancer enabled");
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("balancer disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn collection_status(&self, ns: &Namespace) -> Result<CollectionBalanceStatus> {
        self.catalog
            .read(|state| collection_status(state, ns, self.config.imbalance_threshold))
    }

    /// Plan and execute one round. Migration failures are recorded in the
    /// report; the next round retries them.
    pub async fn run_round(&self) -> RoundReport {
        let (planned, skipped) = self
            .catalog
            .read(|state| plan_round(state, self.config.imbalance_threshold));
        for (ns, reason) in &skipped {
            tracing::debug!(ns = %ns, ?reason, "balancer skipped collection");
        }

        let mut in_flight = planned
            .iter()
            .cloned()
            .map(|plan| {
                let coordinator = Arc::clone(&self.coordinator);
                async move {
                    let result = coordinator
                        .move_chunk(MoveChunkRequest {
                            ns: plan.ns.clone(),
                            find: plan.range.min.clone(),
                            to: plan.to.clone(),
                        })
                        .await;
                    (plan, result)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut report = RoundReport {
            planned: planned.clone(),
            skipped,
            ..RoundReport::default()
        };
        while let Some((plan, result)) = in_flight.next().await {
            match result {
                Ok(outcome) => report.succeeded.push(outcome),
                Err(err) => {
                    tracing::warn!(
                        ns = %plan.ns,
                        range = %plan.range,
                        from = %plan.from,
                        to = %plan.to,
                        error = ?err,
                        "balancer migration failed"
                    );
                    report.failed.push((plan, err));
                }
            }
        }
        report
    }

    /// Run rounds until one plans nothing. Returns the number of rounds that
    /// issued migrations.
    pub async fn balance_until_converged(&self, max_rounds: usize) -> Result<usize> {
        for round in 0..max_rounds {
            let report = self.run_round().await;
            if report.planned.is_empty() {
                return Ok(round);
            }
        }
        Err(ShardingError::Timeout(format!(
            "balancer did not converge within {max_rounds} rounds"
        )))
    }

    /// Spawn the background loop. Rounds only run while enabled.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                ticker.tick().await;
                if !self.is_enabled() {
                    continue;
                }
                let report = self.run_round().await;
                if !report.failed.is_empty() {
                    tracing::warn!(
                        failed = report.failed.len(),
                        succeeded = report.succeeded.len(),
                        "balancer round had failures"
                    );
                }
            }
        })
    }
}
