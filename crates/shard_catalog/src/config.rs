//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::balancer::BalancerConfig;
use crate::cache::CacheConfig;
use crate::history::FeatureLevel;
use crate::migration::MigrationConfig;

/// Tunables for every component of a [`crate::service::ShardingService`].
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub migration: MigrationConfig,
    pub balancer: BalancerConfig,
    pub cache: CacheConfig,
}

#[derive(Parser, Debug, Clone)]
pub struct CatalogArgs {
    /// Directory holding `catalog.json` and one fjall keyspace per shard.
    /// Runs fully in memory when unset.
    #[arg(long, env = "SHARD_CATALOG_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Number of data shards (`shard0`, `shard1`, ...).
    #[arg(long, env = "SHARD_CATALOG_SHARDS", default_value_t = 2)]
    pub shards: usize,

    /// Cluster feature level: `latest` records chunk history, `last-stable`
    /// does not.
    #[arg(long, env = "SHARD_CATALOG_FEATURE_LEVEL", default_value = "latest")]
    pub feature_level: FeatureLevel,

    /// Balancer round interval (ms).
    #[arg(long, env = "SHARD_CATALOG_BALANCER_INTERVAL_MS", default_value_t = 10_000)]
    pub balancer_interval_ms: u64,

    /// Maximum tolerated difference in chunk count between two shards.
    #[arg(long, env = "SHARD_CATALOG_BALANCER_THRESHOLD", default_value_t = 1)]
    pub balancer_threshold: usize,

    /// Documents per clone page and catch-up round.
    #[arg(long, env = "SHARD_CATALOG_MIGRATION_BATCH_SIZE", default_value_t = 256)]
    pub migration_batch_size: usize,

    #[arg(long, env = "SHARD_CATALOG_CATCHUP_THRESHOLD", default_value_t = 0)]
    pub catchup_threshold: usize,

    #[arg(long, env = "SHARD_CATALOG_MAX_CATCHUP_ROUNDS", default_value_t = 64)]
    pub max_catchup_rounds: u32,

    #[arg(long, env = "SHARD_CATALOG_MIGRATION_RETRY_BASE_MS", default_value_t = 50)]
    pub migration_retry_base_ms: u64,

    #[arg(long, env = "SHARD_CATALOG_MIGRATION_RETRY_MAX_MS", default_value_t = 5_000)]
    pub migration_retry_max_ms: u64,

    #[arg(long, env = "SHARD_CATALOG_MIGRATION_MAX_RETRIES", default_value_t = 5)]
    pub migration_max_retries: u32,

    /// Time limit for each of the cloning and catch-up phases (ms).
    #[arg(long, env = "SHARD_CATALOG_MIGRATION_PHASE_TIMEOUT_MS", default_value_t = 60_000)]
    pub migration_phase_timeout_ms: u64,

    /// Refuse to move chunks holding more documents than this and mark them
    /// jumbo.
    #[arg(long, env = "SHARD_CATALOG_MAX_CHUNK_DOCUMENTS")]
    pub max_chunk_documents: Option<u64>,

    #[arg(long, env = "SHARD_CATALOG_CACHE_REFRESH_ATTEMPTS", default_value_t = 5)]
    pub cache_refresh_attempts: u32,

    #[arg(long, env = "SHARD_CATALOG_CACHE_REFRESH_BACKOFF_MS", default_value_t = 20)]
    pub cache_refresh_backoff_ms: u64,
}

impl CatalogArgs {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            migration: MigrationConfig {
                clone_batch_size: self.migration_batch_size.max(1),
                catchup_threshold: self.catchup_threshold,
                max_catchup_rounds: self.max_catchup_rounds,
                retry_base: Duration::from_millis(self.migration_retry_base_ms),
                retry_max: Duration::from_millis(
                    self.migration_retry_max_ms.max(self.migration_retry_base_ms),
                ),
                max_retries: self.migration_max_retries,
                phase_timeout: Duration::from_millis(self.migration_phase_timeout_ms.max(1)),
                max_chunk_documents: self.max_chunk_documents,
            },
            balancer: BalancerConfig {
                interval: Duration::from_millis(self.balancer_interval_ms.max(1)),
                imbalance_threshold: self.balancer_threshold,
            },
            cache: CacheConfig {
                refresh_attempts: self.cache_refresh_attempts.max(1),
                refresh_backoff: Duration::from_millis(self.cache_refresh_backoff_ms),
            },
        }
    }
}
