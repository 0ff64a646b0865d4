//! Error kinds surfaced by catalog, cache and migration operations.

use thiserror::Error;
use uuid::Uuid;

use crate::types::{ChunkRange, KeyValue, LogicalTime, Namespace, ShardId};
use crate::version::ChunkVersion;

#[derive(Debug, Error)]
pub enum ShardingError {
    /// A migration (or migration-blocking operation) already owns the target.
    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    /// Caller's view of the collection identity is stale.
    #[error("collection uuid mismatch for {ns}: expected {expected}, found {actual}")]
    InvalidUuid {
        ns: Namespace,
        expected: Uuid,
        actual: Uuid,
    },

    #[error("stale config for {ns}: received {received}, wanted {wanted:?}")]
    StaleConfig {
        ns: Namespace,
        received: ChunkVersion,
        wanted: Option<ChunkVersion>,
    },

    #[error("no chunk history available for {ns} at {at}")]
    NoHistoryAvailable { ns: Namespace, at: LogicalTime },

    #[error("namespace {0} not found")]
    NamespaceNotFound(Namespace),

    #[error("namespace {0} is already sharded")]
    NamespaceExists(Namespace),

    #[error("shard {0} not found")]
    ShardNotFound(ShardId),

    #[error("no chunk of {ns} contains key {key}")]
    ChunkNotFound { ns: Namespace, key: KeyValue },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("chunk {range} of {ns} is too big to move ({documents} documents)")]
    ChunkTooBig {
        ns: Namespace,
        range: ChunkRange,
        documents: u64,
    },

    #[error("writes to {range} of {ns} are blocked by a migration critical section")]
    MigrationCriticalSection { ns: Namespace, range: ChunkRange },

    #[error("migration cancelled: {0}")]
    MigrationCancelled(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShardingError {
    /// Whether a caller may retry the same request after refreshing or waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardingError::StaleConfig { .. }
                | ShardingError::MigrationCriticalSection { .. }
                | ShardingError::Storage(_)
                | ShardingError::Timeout(_)
        )
    }

    /// Stable code name, as reported back to clients.
    pub fn code_name(&self) -> &'static str {
        match self {
            ShardingError::ConflictingOperationInProgress(_) => "ConflictingOperationInProgress",
            ShardingError::InvalidUuid { .. } => "InvalidUUID",
            ShardingError::StaleConfig { .. } => "StaleConfig",
            ShardingError::NoHistoryAvailable { .. } => "NoHistoryAvailable",
            ShardingError::NamespaceNotFound(_) => "NamespaceNotFound",
            ShardingError::NamespaceExists(_) => "AlreadyInitialized",
            ShardingError::ShardNotFound(_) => "ShardNotFound",
            ShardingError::ChunkNotFound { .. } => "ChunkNotFound",
            ShardingError::InvalidOptions(_) => "InvalidOptions",
            ShardingError::IllegalOperation(_) => "IllegalOperation",
            ShardingError::ChunkTooBig { .. } => "ChunkTooBig",
            ShardingError::MigrationCriticalSection { .. } => "StaleConfigInCriticalSection",
            ShardingError::MigrationCancelled(_) => "Interrupted",
            ShardingError::Timeout(_) => "ExceededTimeLimit",
            ShardingError::Storage(_) | ShardingError::Internal(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ShardingError>;
