//! Collection and chunk versioning.
//!
//! A version is `(epoch, timestamp, major, minor)`. Within one epoch versions
//! are totally ordered by `(major, minor)`; versions from different epochs are
//! incomparable and force a full metadata refetch.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ShardingError};
use crate::types::LogicalTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: Uuid,
    pub timestamp: LogicalTime,
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    /// Version of the first chunk of a freshly (re)created collection.
    pub fn initial(epoch: Uuid, timestamp: LogicalTime) -> Self {
        Self {
            epoch,
            timestamp,
            major: 1,
            minor: 0,
        }
    }

    pub fn is_same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch && self.timestamp == other.timestamp
    }

    /// Epoch-aware comparison; `None` when the versions belong to different
    /// incarnations of the collection.
    pub fn compare(&self, other: &ChunkVersion) -> Option<Ordering> {
        if !self.is_same_epoch(other) {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }

    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        self.compare(other) == Some(Ordering::Less)
    }

    pub fn next_major(&self) -> Result<Self> {
        let major = self.major.checked_add(1).ok_or_else(|| {
            ShardingError::Internal(format!("major version exhausted at {self}"))
        })?;
        Ok(Self {
            major,
            minor: 0,
            ..*self
        })
    }

    pub fn next_minor(&self) -> Result<Self> {
        let minor = self.minor.checked_add(1).ok_or_else(|| {
            ShardingError::Internal(format!("minor version exhausted at {self}"))
        })?;
        Ok(Self { minor, ..*self })
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}||{}||{}",
            self.major, self.minor, self.epoch, self.timestamp
        )
    }
}

/// The kind of metadata write a version bump accompanies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBump {
    /// Chunk ownership moved to another shard.
    Migration,
    /// One chunk became `pieces` chunks.
    Split { pieces: usize },
    /// Several chunks became one.
    Merge,
    /// Collection-level change that leaves chunk ownership alone (gate
    /// toggles, history rewrites, balancing settings).
    CollectionOnly,
}

/// Compute the versions for one metadata write.
///
/// Returns the new collection version and the versions to stamp on the chunks
/// the write produces (empty for [`VersionBump::CollectionOnly`]). The last
/// chunk version always equals the new collection version. Fails instead of
/// wrapping when a counter is exhausted.
pub fn bump(current: ChunkVersion, kind: VersionBump) -> Result<(ChunkVersion, Vec<ChunkVersion>)> {
    match kind {
        VersionBump::Migration => {
            let next = current.next_major()?;
            Ok((next, vec![next]))
        }
        VersionBump::Split { pieces } => {
            let mut versions = Vec::with_capacity(pieces);
            let mut next = current;
            for _ in 0..pieces.max(1) {
                next = next.next_minor()?;
                versions.push(next);
            }
            Ok((next, versions))
        }
        VersionBump::Merge => {
            let next = current.next_minor()?;
            Ok((next, vec![next]))
        }
        VersionBump::CollectionOnly => Ok((current.next_minor()?, Vec::new())),
    }
}
