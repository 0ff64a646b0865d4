//! Shard-local document storage.
//!
//! Documents are keyed by `(ns, shard key value, _id)` in key-space order so
//! a chunk range is one contiguous scan. Two engines implement
//! [`DocumentStore`]: an in-memory map and a fjall keyspace.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChunkRange, KeyValue, Namespace};

/// A document together with the index fields it is stored under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub key: KeyValue,
    pub id: String,
    pub doc: Value,
}

/// Exclusive resume point for paged range scans.
pub type ScanCursor = (KeyValue, String);

pub trait DocumentStore: Send + Sync + 'static {
    /// Insert or replace the document `(key, id)`.
    fn put(&self, ns: &Namespace, doc: &StoredDocument) -> anyhow::Result<()>;

    fn put_batch(&self, ns: &Namespace, docs: &[StoredDocument]) -> anyhow::Result<()> {
        for doc in docs {
            self.put(ns, doc)?;
        }
        Ok(())
    }

    /// Returns whether a document was removed.
    fn delete(&self, ns: &Namespace, key: &KeyValue, id: &str) -> anyhow::Result<bool>;

    /// All documents whose shard key equals `key`.
    fn find(&self, ns: &Namespace, key: &KeyValue) -> anyhow::Result<Vec<StoredDocument>>;

    /// Up to `limit` documents of `range` ordered by `(key, id)`, starting
    /// after `after` when given.
    fn scan_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredDocument>>;

    fn count_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64>;

    /// Remove every document of `range`; returns how many were removed.
    fn delete_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64>;
}

type MemKey = (String, KeyValue, String);

#[derive(Default)]
pub struct MemDocumentStore {
    inner: RwLock<BTreeMap<MemKey, StoredDocument>>,
}

impl MemDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn mem_key(ns: &Namespace, key: &KeyValue, id: &str) -> MemKey {
    (ns.as_str().to_string(), key.clone(), id.to_string())
}

fn mem_bounds(
    ns: &Namespace,
    range: &ChunkRange,
    after: Option<&ScanCursor>,
) -> (Bound<MemKey>, Bound<MemKey>) {
    // Ids are never empty, so `(ns, bound, "")` sorts before every document
    // stored at `bound`.
    let start = match after {
        Some((key, id)) => Bound::Excluded(mem_key(ns, key, id)),
        None => Bound::Included(mem_key(ns, &range.min, "")),
    };
    (start, Bound::Excluded(mem_key(ns, &range.max, "")))
}

impl DocumentStore for MemDocumentStore {
    fn put(&self, ns: &Namespace, doc: &StoredDocument) -> anyhow::Result<()> {
        anyhow::ensure!(!doc.id.is_empty(), "document _id must not be empty");
        self.inner
            .write()
            .unwrap()
            .insert(mem_key(ns, &doc.key, &doc.id), doc.clone());
        Ok(())
    }

    fn delete(&self, ns: &Namespace, key: &KeyValue, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .inner
            .write()
            .unwrap()
            .remove(&mem_key(ns, key, id))
            .is_some())
    }

    fn find(&self, ns: &Namespace, key: &KeyValue) -> anyhow::Result<Vec<StoredDocument>> {
        let guard = self.inner.read().unwrap();
        Ok(guard
            .range(mem_key(ns, key, "")..)
            .take_while(|((doc_ns, doc_key, _), _)| doc_ns == ns.as_str() && doc_key == key)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn scan_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredDocument>> {
        let guard = self.inner.read().unwrap();
        Ok(guard
            .range(mem_bounds(ns, range, after))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn count_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64> {
        let guard = self.inner.read().unwrap();
        Ok(guard.range(mem_bounds(ns, range, None)).count() as u64)
    }

    fn delete_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64> {
        let mut guard = self.inner.write().unwrap();
        let keys = guard
            .range(mem_bounds(ns, range, None))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for key in &keys {
            guard.remove(key);
        }
        Ok(keys.len() as u64)
    }
}

const DOCS_PARTITION: &str = "docs";
/// Keys removed per fjall batch during range deletion.
const DELETE_BATCH: usize = 512;

pub struct FjallDocumentStore {
    keyspace: Arc<Keyspace>,
    docs: fjall::PartitionHandle,
}

impl FjallDocumentStore {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create document store dir {}", dir.display()))?;
        let keyspace = Arc::new(
            fjall::Config::new(dir)
                .open()
                .with_context(|| format!("open fjall keyspace {}", dir.display()))?,
        );
        Self::with_keyspace(keyspace)
    }

    pub fn with_keyspace(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let docs = keyspace
            .open_partition(DOCS_PARTITION, PartitionCreateOptions::default())
            .context("open docs partition")?;
        Ok(Self { keyspace, docs })
    }

    fn range_keys(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        after: Option<&ScanCursor>,
    ) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let start = match after {
            Some((key, id)) => Bound::Excluded(encode_doc_key(ns, key, id)),
            None => Bound::Included(encode_key_prefix(ns, &range.min)),
        };
        (start, Bound::Excluded(encode_key_prefix(ns, &range.max)))
    }
}

impl DocumentStore for FjallDocumentStore {
    fn put(&self, ns: &Namespace, doc: &StoredDocument) -> anyhow::Result<()> {
        anyhow::ensure!(!doc.id.is_empty(), "document _id must not be empty");
        let value = serde_json::to_vec(doc).context("encode document")?;
        self.docs
            .insert(encode_doc_key(ns, &doc.key, &doc.id), value)
            .context("fjall document write")?;
        Ok(())
    }

    fn put_batch(&self, ns: &Namespace, docs: &[StoredDocument]) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for doc in docs {
            anyhow::ensure!(!doc.id.is_empty(), "document _id must not be empty");
            let value = serde_json::to_vec(doc).context("encode document")?;
            batch.insert(&self.docs, encode_doc_key(ns, &doc.key, &doc.id), value);
        }
        batch.commit().context("fjall document batch write")?;
        Ok(())
    }

    fn delete(&self, ns: &Namespace, key: &KeyValue, id: &str) -> anyhow::Result<bool> {
        let doc_key = encode_doc_key(ns, key, id);
        let existed = self
            .docs
            .get(&doc_key)
            .context("fjall document read")?
            .is_some();
        if existed {
            self.docs.remove(doc_key).context("fjall document delete")?;
        }
        Ok(existed)
    }

    fn find(&self, ns: &Namespace, key: &KeyValue) -> anyhow::Result<Vec<StoredDocument>> {
        let mut out = Vec::new();
        for item in self.docs.prefix(encode_key_prefix(ns, key)) {
            let (_, value) = item.context("fjall document scan")?;
            out.push(serde_json::from_slice(&value).context("decode document")?);
        }
        Ok(out)
    }

    fn scan_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredDocument>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for item in self.docs.range(self.range_keys(ns, range, after)).take(limit) {
            let (_, value) = item.context("fjall document scan")?;
            out.push(serde_json::from_slice(&value).context("decode document")?);
        }
        Ok(out)
    }

    fn count_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64> {
        let mut count = 0u64;
        for item in self.docs.range(self.range_keys(ns, range, None)) {
            item.context("fjall document scan")?;
            count += 1;
        }
        Ok(count)
    }

    fn delete_range(&self, ns: &Namespace, range: &ChunkRange) -> anyhow::Result<u64> {
        let mut removed = 0u64;
        let mut batch = self.keyspace.batch();
        let mut pending = 0usize;
        for item in self.docs.range(self.range_keys(ns, range, None)) {
            let (key, _) = item.context("fjall document scan")?;
            batch.remove(&self.docs, key.to_vec());
            pending += 1;
            removed += 1;
            if pending >= DELETE_BATCH {
                batch.commit().context("fjall range delete")?;
                batch = self.keyspace.batch();
                pending = 0;
            }
        }
        if pending > 0 {
            batch.commit().context("fjall range delete")?;
        }
        Ok(removed)
    }
}

fn encode_key_prefix(ns: &Namespace, key: &KeyValue) -> Vec<u8> {
    let ns = ns.as_str().as_bytes();
    let mut out = Vec::with_capacity(4 + ns.len() + 16);
    out.extend_from_slice(&(ns.len() as u32).to_be_bytes());
    out.extend_from_slice(ns);
    encode_key_value(key, &mut out);
    out
}

fn encode_doc_key(ns: &Namespace, key: &KeyValue, id: &str) -> Vec<u8> {
    let mut out = encode_key_prefix(ns, key);
    out.extend_from_slice(id.as_bytes());
    out
}

/// Order-preserving encoding: byte order of the output matches `KeyValue`
/// order, and no encoding is a prefix of a different value's encoding.
fn encode_key_value(key: &KeyValue, out: &mut Vec<u8>) {
    match key {
        KeyValue::MinKey => out.push(0),
        KeyValue::Int(v) => {
            out.push(1);
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        KeyValue::Str(s) => {
            out.push(2);
            for b in s.as_bytes() {
                if *b == 0 {
                    out.extend_from_slice(&[0, 0xff]);
                } else {
                    out.push(*b);
                }
            }
            out.extend_from_slice(&[0, 0]);
        }
        KeyValue::MaxKey => out.push(3),
    }
}
