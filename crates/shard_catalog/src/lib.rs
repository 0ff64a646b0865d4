//! Sharded-collection chunk metadata and migration coordination.
//!
//! The catalog is the authoritative record of which shard owns each chunk of
//! each collection. Chunk moves go through the migration coordinator, which
//! honours the per-collection migration gate and commits ownership changes as
//! single catalog writes; the balancer drives those moves automatically.
//! Higher layers talk to [`service::ShardingService`].

pub mod balancer;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gate;
pub mod history;
pub mod migration;
pub mod service;
pub mod shard;
pub mod storage;
pub mod types;
pub mod version;

pub use error::{Result, ShardingError};
pub use service::ShardingService;
pub use types::{ChunkRange, KeyValue, LogicalTime, Namespace, ShardId};
pub use version::ChunkVersion;
