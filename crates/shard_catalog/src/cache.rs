//! Shard-local, read-through copy of collection and chunk metadata.
//!
//! Requests carry the collection version the sender routed with. A lookup
//! either serves the cached entry (`Fresh`) or reports staleness as a value
//! (`Stale`) so the caller decides whether to refresh. Refreshes re-fetch the
//! whole namespace from the catalog and swap the entry atomically; an entry
//! never moves backwards within an epoch.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::catalog::{CatalogStore, ChunkType, CollectionType};
use crate::error::{Result, ShardingError};
use crate::types::{KeyValue, Namespace, ShardId};
use crate::version::ChunkVersion;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Fetch attempts before a refresh that keeps seeing an older version
    /// than the one that triggered it gives up.
    pub refresh_attempts: u32,
    pub refresh_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_attempts: 5,
            refresh_backoff: Duration::from_millis(20),
        }
    }
}

/// One namespace as fetched from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCollection {
    pub collection: CollectionType,
    pub chunks: Vec<ChunkType>,
}

impl CachedCollection {
    pub fn version(&self) -> ChunkVersion {
        self.collection.version
    }

    pub fn chunk_for_key(&self, key: &KeyValue) -> Option<&ChunkType> {
        self.chunks.iter().find(|c| c.range.contains(key))
    }

    /// Chunks owned by `shard`.
    pub fn owned_by<'a>(&'a self, shard: &'a ShardId) -> impl Iterator<Item = &'a ChunkType> + 'a {
        self.chunks.iter().filter(move |c| c.shard == *shard)
    }
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Fresh(Arc<CachedCollection>),
    Stale {
        received: ChunkVersion,
        cached: Option<ChunkVersion>,
    },
}

impl CacheLookup {
    /// Whether the sender is ahead of this cache (or on another epoch), i.e.
    /// the cache rather than the sender must refresh.
    pub fn cache_is_behind(&self) -> bool {
        match self {
            CacheLookup::Fresh(_) => false,
            CacheLookup::Stale { received, cached } => match cached {
                None => true,
                Some(cached) => cached.compare(received) != Some(Ordering::Greater),
            },
        }
    }
}

pub struct ShardCatalogCache {
    shard: ShardId,
    catalog: CatalogStore,
    config: CacheConfig,
    entries: RwLock<HashMap<Namespace, Arc<CachedCollection>>>,
}

impl ShardCatalogCache {
    pub fn new(shard: ShardId, catalog: CatalogStore, config: CacheConfig) -> Self {
        Self {
            shard,
            catalog,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, ns: &Namespace) -> Option<Arc<CachedCollection>> {
        self.entries.read().unwrap().get(ns).cloned()
    }

    pub fn lookup(&self, ns: &Namespace, received: &ChunkVersion) -> CacheLookup {
        match self.get(ns) {
            Some(entry) if entry.version().compare(received) == Some(Ordering::Equal) => {
                CacheLookup::Fresh(entry)
            }
            entry => CacheLookup::Stale {
                received: *received,
                cached: entry.map(|e| e.version()),
            },
        }
    }

    pub fn evict(&self, ns: &Namespace) {
        if self.entries.write().unwrap().remove(ns).is_some() {
            tracing::debug!(shard = %self.shard, ns = %ns, "evicted cached collection");
        }
    }

    /// Re-fetch `ns` from the catalog. When `min_version` is given, a fetched
    /// version older than it is never installed; the fetch is retried with
    /// backoff instead. Returns `None` when the collection no longer exists.
    pub async fn refresh(
        &self,
        ns: &Namespace,
        min_version: Option<ChunkVersion>,
    ) -> Result<Option<Arc<CachedCollection>>> {
        let attempts = self.config.refresh_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (collection, chunks) = match self.catalog.collection_and_chunks(ns) {
                Ok(found) => found,
                Err(ShardingError::NamespaceNotFound(_)) => {
                    self.evict(ns);
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            let fetched = collection.version;
            if let Some(min) = min_version {
                if fetched.is_older_than(&min) {
                    if attempt >= attempts {
                        return Err(ShardingError::StaleConfig {
                            ns: ns.clone(),
                            received: min,
                            wanted: Some(fetched),
                        });
                    }
                    tracing::debug!(
                        shard = %self.shard,
                        ns = %ns,
                        fetched = %fetched,
                        wanted = %min,
                        attempt,
                        "refresh fetched an older version, retrying"
                    );
                    tokio::time::sleep(self.config.refresh_backoff * attempt).await;
                    continue;
                }
            }
            return Ok(Some(self.install(CachedCollection { collection, chunks })));
        }
    }

    /// Spawn a background refresh on the current runtime; failures are
    /// logged. Outside a runtime nothing is spawned and the next explicit
    /// `refresh` catches the cache up.
    pub fn trigger_refresh(
        self: &Arc<Self>,
        ns: Namespace,
        min_version: Option<ChunkVersion>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(shard = %self.shard, ns = %ns, "no runtime, skipping background refresh");
            return None;
        };
        let cache = Arc::clone(self);
        Some(handle.spawn(async move {
            if let Err(err) = cache.refresh(&ns, min_version).await {
                tracing::warn!(shard = %cache.shard, ns = %ns, error = ?err, "catalog cache refresh failed");
            }
        }))
    }

    fn install(&self, fetched: CachedCollection) -> Arc<CachedCollection> {
        let ns = fetched.collection.ns.clone();
        let mut entries = self.entries.write().unwrap();
        if let Some(current) = entries.get(&ns) {
            // A concurrent refresh may already have installed something newer.
            if fetched.version().compare(&current.version()) == Some(Ordering::Less) {
                return Arc::clone(current);
            }
        }
        let fetched = Arc::new(fetched);
        tracing::debug!(
            shard = %self.shard,
            ns = %ns,
            version = %fetched.version(),
            "installed cached collection"
        );
        entries.insert(ns, Arc::clone(&fetched));
        fetched
    }
}
