//! A data-holding shard: version-checked document access plus the donor and
//! recipient primitives chunk migrations are built from.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use crate::cache::{CacheLookup, CachedCollection, ShardCatalogCache};
use crate::catalog::ChunkType;
use crate::error::{Result, ShardingError};
use crate::storage::{DocumentStore, ScanCursor, StoredDocument};
use crate::types::{ChunkRange, KeyValue, Namespace, ShardId, ShardKeyPattern};
use crate::version::ChunkVersion;

/// A write observed on the donor while a chunk is being cloned.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Upsert(StoredDocument),
    Delete { key: KeyValue, id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureId(u64);

struct CaptureSession {
    ns: Namespace,
    range: ChunkRange,
    changes: VecDeque<ChangeEvent>,
}

pub struct ShardNode {
    id: ShardId,
    store: Arc<dyn DocumentStore>,
    cache: Arc<ShardCatalogCache>,
    /// Serializes document writes against critical-section entry and capture
    /// registration.
    write_lock: Mutex<()>,
    critical_sections: RwLock<Vec<(Namespace, ChunkRange)>>,
    captures: Mutex<HashMap<CaptureId, CaptureSession>>,
    next_capture: AtomicU64,
}

/// Shards reachable from this process, by id.
#[derive(Clone, Default)]
pub struct ShardSet {
    inner: Arc<RwLock<BTreeMap<ShardId, Arc<ShardNode>>>>,
}

impl ShardSet {
    pub fn insert(&self, node: Arc<ShardNode>) {
        self.inner.write().unwrap().insert(node.id().clone(), node);
    }

    pub fn get(&self, id: &ShardId) -> Result<Arc<ShardNode>> {
        self.inner
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ShardingError::ShardNotFound(id.clone()))
    }

    pub fn all(&self) -> Vec<Arc<ShardNode>> {
        self.inner.read().unwrap().values().cloned().collect()
    }
}

/// Document `_id` as stored: strings verbatim, anything else as its JSON text.
pub fn document_id(doc: &Value) -> Result<String> {
    match doc.get("_id") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Null) | None => Err(ShardingError::InvalidOptions(
            "document is missing _id".to_string(),
        )),
        Some(Value::String(_)) => Err(ShardingError::InvalidOptions(
            "document _id must not be empty".to_string(),
        )),
        Some(other) => Ok(other.to_string()),
    }
}

impl ShardNode {
    pub fn new(
        id: ShardId,
        store: Arc<dyn DocumentStore>,
        cache: Arc<ShardCatalogCache>,
    ) -> Self {
        Self {
            id,
            store,
            cache,
            write_lock: Mutex::new(()),
            critical_sections: RwLock::new(Vec::new()),
            captures: Mutex::new(HashMap::new()),
            next_capture: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn cache(&self) -> &Arc<ShardCatalogCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Validate the sender's routing version against the local cache and,
    /// for keyed requests, that this shard owns the key.
    fn check_shard_version(
        &self,
        ns: &Namespace,
        received: &ChunkVersion,
        key: Option<&KeyValue>,
    ) -> Result<Arc<CachedCollection>> {
        let lookup = self.cache.lookup(ns, received);
        let cache_is_behind = lookup.cache_is_behind();
        match lookup {
            CacheLookup::Fresh(entry) => {
                if let Some(key) = key {
                    let owned = entry
                        .chunk_for_key(key)
                        .map(|c| c.shard == self.id)
                        .unwrap_or(false);
                    if !owned {
                        return Err(ShardingError::StaleConfig {
                            ns: ns.clone(),
                            received: *received,
                            wanted: Some(entry.version()),
                        });
                    }
                }
                Ok(entry)
            }
            CacheLookup::Stale { received, cached } => {
                if cache_is_behind {
                    self.cache.trigger_refresh(ns.clone(), Some(received));
                }
                Err(ShardingError::StaleConfig {
                    ns: ns.clone(),
                    received,
                    wanted: cached,
                })
            }
        }
    }

    fn in_critical_section(&self, ns: &Namespace, key: &KeyValue) -> Option<ChunkRange> {
        self.critical_sections
            .read()
            .unwrap()
            .iter()
            .find(|(cs_ns, range)| cs_ns == ns && range.contains(key))
            .map(|(_, range)| range.clone())
    }

    fn record_change(&self, ns: &Namespace, key: &KeyValue, event: ChangeEvent) {
        let mut captures = self.captures.lock().unwrap();
        for session in captures.values_mut() {
            if session.ns == *ns && session.range.contains(key) {
                session.changes.push_back(event.clone());
            }
        }
    }

    /// Insert or replace a document routed with `version`.
    pub fn insert(&self, ns: &Namespace, version: &ChunkVersion, doc: Value) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let entry = self.check_shard_version(ns, version, None)?;
        let key = entry.collection.key_pattern.extract(&doc)?;
        let id = document_id(&doc)?;
        self.check_shard_version(ns, version, Some(&key))?;
        if let Some(range) = self.in_critical_section(ns, &key) {
            return Err(ShardingError::MigrationCriticalSection {
                ns: ns.clone(),
                range,
            });
        }
        let stored = StoredDocument { key, id, doc };
        self.store.put(ns, &stored)?;
        let key = stored.key.clone();
        self.record_change(ns, &key, ChangeEvent::Upsert(stored));
        Ok(())
    }

    pub fn delete(
        &self,
        ns: &Namespace,
        version: &ChunkVersion,
        key: &KeyValue,
        id: &str,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        self.check_shard_version(ns, version, Some(key))?;
        if let Some(range) = self.in_critical_section(ns, key) {
            return Err(ShardingError::MigrationCriticalSection {
                ns: ns.clone(),
                range,
            });
        }
        let removed = self.store.delete(ns, key, id)?;
        if removed {
            self.record_change(
                ns,
                key,
                ChangeEvent::Delete {
                    key: key.clone(),
                    id: id.to_string(),
                },
            );
        }
        Ok(removed)
    }

    pub fn find(&self, ns: &Namespace, version: &ChunkVersion, key: &KeyValue) -> Result<Vec<Value>> {
        self.check_shard_version(ns, version, Some(key))?;
        Ok(self
            .store
            .find(ns, key)?
            .into_iter()
            .map(|d| d.doc)
            .collect())
    }

    // Donor side.

    /// Start recording writes to `range`. Writes already applied are visible
    /// to a subsequent clone scan; later ones are captured.
    pub fn start_capture(&self, ns: &Namespace, range: &ChunkRange) -> CaptureId {
        let _guard = self.write_lock.lock().unwrap();
        let id = CaptureId(self.next_capture.fetch_add(1, Ordering::Relaxed));
        self.captures.lock().unwrap().insert(
            id,
            CaptureSession {
                ns: ns.clone(),
                range: range.clone(),
                changes: VecDeque::new(),
            },
        );
        id
    }

    /// Take up to `max` captured changes in write order.
    pub fn drain_capture(&self, id: CaptureId, max: usize) -> Vec<ChangeEvent> {
        let mut captures = self.captures.lock().unwrap();
        let Some(session) = captures.get_mut(&id) else {
            return Vec::new();
        };
        let take = max.min(session.changes.len());
        session.changes.drain(..take).collect()
    }

    pub fn capture_backlog(&self, id: CaptureId) -> usize {
        self.captures
            .lock()
            .unwrap()
            .get(&id)
            .map(|s| s.changes.len())
            .unwrap_or(0)
    }

    pub fn stop_capture(&self, id: CaptureId) {
        self.captures.lock().unwrap().remove(&id);
    }

    /// Block writes to `range`. Waits for in-flight writes to finish.
    pub fn enter_critical_section(&self, ns: &Namespace, range: &ChunkRange) {
        let _guard = self.write_lock.lock().unwrap();
        let mut sections = self.critical_sections.write().unwrap();
        if !sections.iter().any(|(n, r)| n == ns && r == range) {
            sections.push((ns.clone(), range.clone()));
        }
        tracing::debug!(shard = %self.id, ns = %ns, range = %range, "entered critical section");
    }

    pub fn exit_critical_section(&self, ns: &Namespace, range: &ChunkRange) {
        let mut sections = self.critical_sections.write().unwrap();
        let before = sections.len();
        sections.retain(|(n, r)| !(n == ns && r == range));
        if sections.len() != before {
            tracing::debug!(shard = %self.id, ns = %ns, range = %range, "left critical section");
        }
    }

    pub fn scan_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>> {
        Ok(self.store.scan_range(ns, range, after, limit)?)
    }

    pub fn count_range(&self, ns: &Namespace, range: &ChunkRange) -> Result<u64> {
        Ok(self.store.count_range(ns, range)?)
    }

    // Recipient side. These bypass version checks: the recipient does not own
    // the range until the migration commits.

    pub fn receive_documents(&self, ns: &Namespace, docs: &[StoredDocument]) -> Result<()> {
        Ok(self.store.put_batch(ns, docs)?)
    }

    pub fn apply_changes(&self, ns: &Namespace, changes: &[ChangeEvent]) -> Result<()> {
        for change in changes {
            match change {
                ChangeEvent::Upsert(doc) => self.store.put(ns, doc)?,
                ChangeEvent::Delete { key, id } => {
                    self.store.delete(ns, key, id)?;
                }
            }
        }
        Ok(())
    }

    /// Delete local documents of `ns` that are not stored under
    /// `key_pattern` or that fall in a chunk owned by another shard. Settles
    /// the data of a finished or interrupted reshard.
    pub fn retain_owned(
        &self,
        ns: &Namespace,
        key_pattern: &ShardKeyPattern,
        chunks: &[ChunkType],
        batch: usize,
    ) -> Result<u64> {
        let full = ChunkRange::full();
        let batch = batch.max(1);
        let mut stray = Vec::new();
        let mut after: Option<ScanCursor> = None;
        loop {
            let page = self.store.scan_range(ns, &full, after.as_ref(), batch)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some((last.key.clone(), last.id.clone()));
            let exhausted = page.len() < batch;
            for stored in page {
                let owned = key_pattern.extract(&stored.doc).is_ok_and(|key| {
                    key == stored.key
                        && chunks
                            .iter()
                            .any(|c| c.shard == self.id && c.range.contains(&key))
                });
                if !owned {
                    stray.push((stored.key, stored.id));
                }
            }
            if exhausted {
                break;
            }
        }
        for (key, id) in &stray {
            self.store.delete(ns, key, id)?;
        }
        if !stray.is_empty() {
            tracing::debug!(shard = %self.id, ns = %ns, removed = stray.len(), "removed unowned documents");
        }
        Ok(stray.len() as u64)
    }

    /// Remove this shard's copy of `range`.
    pub fn delete_range(&self, ns: &Namespace, range: &ChunkRange) -> Result<u64> {
        let removed = self.store.delete_range(ns, range)?;
        if removed > 0 {
            tracing::debug!(shard = %self.id, ns = %ns, range = %range, removed, "deleted range");
        }
        Ok(removed)
    }
}
