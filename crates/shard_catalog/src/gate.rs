//! Per-collection migration admission flag.

use uuid::Uuid;

use crate::catalog::{CatalogCommand, CatalogState, CatalogStore};
use crate::error::{Result, ShardingError};
use crate::types::Namespace;
use crate::version::{ChunkVersion, VersionBump};

pub(crate) fn apply_set_allow_migrations(
    state: &mut CatalogState,
    ns: &Namespace,
    allowed: bool,
    expected_uuid: Option<Uuid>,
) -> Result<ChunkVersion> {
    let coll = state.collection_mut(ns)?;
    if let Some(expected) = expected_uuid {
        if expected != coll.uuid {
            return Err(ShardingError::InvalidUuid {
                ns: ns.clone(),
                expected,
                actual: coll.uuid,
            });
        }
    }
    coll.allow_migrations = normalize_allow_migrations(allowed);
    coll.bump(VersionBump::CollectionOnly)?;
    Ok(coll.version)
}

/// `true` is stored as absent.
fn normalize_allow_migrations(allowed: bool) -> Option<bool> {
    if allowed {
        None
    } else {
        Some(false)
    }
}

pub(crate) fn ensure_allowed(state: &CatalogState, ns: &Namespace) -> Result<()> {
    if state.collection(ns)?.allow_migrations() {
        Ok(())
    } else {
        Err(migrations_not_allowed(ns))
    }
}

pub(crate) fn migrations_not_allowed(ns: &Namespace) -> ShardingError {
    ShardingError::ConflictingOperationInProgress(format!(
        "collection {ns} is not allowed to migrate chunks"
    ))
}

/// Reader/writer for the `allow_migrations` flag.
#[derive(Clone)]
pub struct MigrationGate {
    catalog: CatalogStore,
}

impl MigrationGate {
    pub fn new(catalog: CatalogStore) -> Self {
        Self { catalog }
    }

    /// Open or close the gate. Fails with `InvalidUuid` and writes nothing
    /// when `expected_uuid` names a different incarnation of `ns`.
    pub fn set_allow_migrations(
        &self,
        ns: &Namespace,
        allowed: bool,
        expected_uuid: Option<Uuid>,
    ) -> Result<ChunkVersion> {
        let version = self
            .catalog
            .apply(CatalogCommand::SetAllowMigrations {
                ns: ns.clone(),
                allowed,
                expected_uuid,
            })?
            .ok_or_else(|| {
                ShardingError::Internal(format!("gate toggle on {ns} did not bump the version"))
            })?;
        tracing::info!(ns = %ns, allowed, version = %version, "set allow migrations");
        Ok(version)
    }

    pub fn is_allowed(&self, ns: &Namespace) -> Result<bool> {
        self.catalog
            .read(|state| state.collection(ns).map(|c| c.allow_migrations()))
    }

    /// `Ok` when migrations of `ns` may proceed, otherwise the error a
    /// migration request should fail with.
    pub fn ensure_allowed(&self, ns: &Namespace) -> Result<()> {
        self.catalog.read(|state| ensure_allowed(state, ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sharded_store;

    #[test]
    fn closing_gate_stores_false_and_bumps_collection_version_only() {
        let (store, ns) = sharded_store("test.gate", &["shard0"]);
        let gate = MigrationGate::new(store.clone());
        let (before, chunks_before) = store.collection_and_chunks(&ns).expect("coll");

        let closed = gate.set_allow_migrations(&ns, false, None).expect("close");
        assert_eq!((closed.major, closed.minor), (before.version.major, before.version.minor + 1));
        let (after, chunks_after) = store.collection_and_chunks(&ns).expect("coll");
        assert_eq!(after.allow_migrations, Some(false));
        assert_eq!(chunks_before, chunks_after);
        assert!(!gate.is_allowed(&ns).expect("read"));
        assert!(matches!(
            gate.ensure_allowed(&ns),
            Err(ShardingError::ConflictingOperationInProgress(_))
        ));

        let reopened = gate.set_allow_migrations(&ns, true, Some(after.uuid)).expect("open");
        assert_eq!(reopened.minor, closed.minor + 1);
        assert!(store.collection(&ns).expect("coll").allow_migrations.is_none());
        assert!(gate.is_allowed(&ns).expect("read"));
    }

    #[test]
    fn uuid_mismatch_is_rejected_without_a_write() {
        let (store, ns) = sharded_store("test.gate", &["shard0"]);
        let gate = MigrationGate::new(store.clone());
        let before = store.collection(&ns).expect("coll");

        let err = gate
            .set_allow_migrations(&ns, false, Some(Uuid::new_v4()))
            .expect_err("stale uuid");
        assert_eq!(err.code_name(), "InvalidUUID");
        assert_eq!(store.collection(&ns).expect("coll"), before);
    }

    #[test]
    fn unknown_namespace_is_reported() {
        let store = CatalogStore::in_memory();
        let gate = MigrationGate::new(store);
        let ns = Namespace::parse("test.missing").expect("ns");
        assert!(matches!(
            gate.set_allow_migrations(&ns, false, None),
            Err(ShardingError::NamespaceNotFound(_))
        ));
    }
}
