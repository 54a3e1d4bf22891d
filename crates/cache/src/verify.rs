//! Consistency checks: live derived state against a from-scratch rebuild.
//!
//! Every derived table is a function of the raw edges, the raw storage
//! assertions and file-domain membership. A scope is checked by snapshotting
//! its live rows, regenerating it inside a savepoint, snapshotting again and
//! rolling the savepoint back, so the check itself never changes anything.

use crate::counts::CountsStore;
use crate::display::DisplayCoordinator;
use crate::error::{ErrorKind, Result};
use crate::filter::Layer;
use crate::ids::{MappingScope, TagDisplayType, TagId, TagServiceId};
use crate::membership::FileDomainMembership;
use crate::services::ServiceRegistry;
use crate::storage::StorageMappingsCache;
use derive_more::Display;
use exn::ResultExt;
use sqlx::{Connection, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Outcome of a scan that may be cancelled part way.
///
/// An incomplete result is never a wrong one: it covers less, and says so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Complete(T),
    Incomplete(T),
}

impl<T> Completion<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Complete(value) | Self::Incomplete(value) => value,
        }
    }

    pub fn as_ref(&self) -> &T {
        match self {
            Self::Complete(value) | Self::Incomplete(value) => value,
        }
    }
}

/// Which derived table disagreed with its rebuild.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mismatch {
    #[display("storage mappings")]
    StorageMappings,
    #[display("display mappings")]
    DisplayMappings,
    #[display("storage counts")]
    StorageCounts,
    #[display("display counts")]
    DisplayCounts,
    #[display("{_0} sibling lookup")]
    SiblingLookup(TagDisplayType),
    #[display("{_0} parent lookup")]
    ParentLookup(TagDisplayType),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Scopes whose mapping caches and counts were compared.
    pub scopes_checked: usize,
    /// Tag services whose lookups were compared.
    pub services_checked: usize,
    pub scopes: BTreeMap<MappingScope, BTreeSet<Mismatch>>,
    pub services: BTreeMap<TagServiceId, BTreeSet<Mismatch>>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.scopes.is_empty() && self.services.is_empty()
    }

    /// Every mapping scope that needs regenerating. A service with bad
    /// lookups taints all of its scopes.
    pub fn inconsistent_scopes(&self, registry: &ServiceRegistry) -> BTreeSet<MappingScope> {
        let mut scopes: BTreeSet<MappingScope> = self.scopes.keys().copied().collect();
        for service in self.services.keys() {
            scopes.extend(registry.scopes_for(*service));
        }
        scopes
    }
}

/// Live rows of one scope, in comparable form.
#[derive(Debug, PartialEq, Eq)]
struct ScopeState {
    storage: BTreeSet<(i64, i64, i64)>,
    display: BTreeSet<(i64, i64, i64)>,
    storage_counts: BTreeMap<TagId, (u64, u64)>,
    display_counts: BTreeMap<TagId, (u64, u64)>,
}

impl ScopeState {
    async fn load(conn: &mut SqliteConnection, scope: MappingScope) -> Result<Self> {
        Ok(Self {
            storage: Self::rows(conn, Layer::Storage, scope).await?,
            display: Self::rows(conn, Layer::Display, scope).await?,
            storage_counts: CountsStore::all_counts(conn, TagDisplayType::Storage, scope).await?,
            display_counts: CountsStore::all_counts(conn, TagDisplayType::Actual, scope).await?,
        })
    }

    async fn rows(conn: &mut SqliteConnection, layer: Layer, scope: MappingScope) -> Result<BTreeSet<(i64, i64, i64)>> {
        let sql = format!(
            "SELECT tag_id, hash_id, status FROM {} WHERE file_service_id = ? AND tag_service_id = ?",
            layer.table(),
        );
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(&sql)
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().collect())
    }

    fn diff(&self, rebuilt: &Self) -> BTreeSet<Mismatch> {
        let mut mismatches = BTreeSet::new();
        if self.storage != rebuilt.storage {
            mismatches.insert(Mismatch::StorageMappings);
        }
        if self.display != rebuilt.display {
            mismatches.insert(Mismatch::DisplayMappings);
        }
        if self.storage_counts != rebuilt.storage_counts {
            mismatches.insert(Mismatch::StorageCounts);
        }
        if self.display_counts != rebuilt.display_counts {
            mismatches.insert(Mismatch::DisplayCounts);
        }
        mismatches
    }
}

#[derive(Clone, Copy)]
pub struct ConsistencyChecker<'a> {
    registry: &'a ServiceRegistry,
    storage: StorageMappingsCache<'a>,
    coordinator: DisplayCoordinator<'a>,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(registry: &'a ServiceRegistry, membership: &'a dyn FileDomainMembership) -> Self {
        Self {
            registry,
            storage: StorageMappingsCache::new(registry, membership),
            coordinator: DisplayCoordinator::new(registry),
        }
    }

    /// Compare one service's live lookups with freshly resolved ones.
    pub async fn check_lookups(
        &self,
        conn: &mut SqliteConnection,
        service: TagServiceId,
    ) -> Result<BTreeSet<Mismatch>> {
        let mut mismatches = BTreeSet::new();
        for display_type in [TagDisplayType::Ideal, TagDisplayType::Actual] {
            let siblings = self.coordinator.siblings();
            if siblings.lookup(conn, display_type, service).await?
                != siblings.resolve(conn, display_type, service).await?
            {
                mismatches.insert(Mismatch::SiblingLookup(display_type));
            }
            let parents = self.coordinator.parents();
            let mut expected = parents.resolve(conn, display_type, service).await?;
            expected.retain(|_, ancestors| !ancestors.is_empty());
            if parents.lookup(conn, display_type, service).await? != expected {
                mismatches.insert(Mismatch::ParentLookup(display_type));
            }
        }
        Ok(mismatches)
    }

    /// Compare one scope's live mapping caches and counts with a rebuild.
    pub async fn check_scope(&self, conn: &mut SqliteConnection, scope: MappingScope) -> Result<BTreeSet<Mismatch>> {
        let live = ScopeState::load(conn, scope).await?;
        let mut savepoint = conn.begin().await.or_raise(|| ErrorKind::Database)?;
        self.storage.generate(&mut savepoint, scope).await?;
        self.storage.display().generate(&mut savepoint, scope).await?;
        let rebuilt = ScopeState::load(&mut savepoint, scope).await?;
        savepoint.rollback().await.or_raise(|| ErrorKind::Database)?;
        Ok(live.diff(&rebuilt))
    }

    /// Check every service's lookups and every scope's caches, polling
    /// `cancel` every `interval` items.
    #[instrument(skip_all)]
    pub async fn check_all(
        &self,
        conn: &mut SqliteConnection,
        cancel: &CancellationToken,
        interval: usize,
    ) -> Result<Completion<ConsistencyReport>> {
        let interval = interval.max(1);
        let mut report = ConsistencyReport::default();
        let mut items = 0usize;
        for service in self.registry.tag_services() {
            if items % interval == 0 && cancel.is_cancelled() {
                return Ok(Completion::Incomplete(report));
            }
            items += 1;
            let mismatches = self.check_lookups(conn, service).await?;
            report.services_checked += 1;
            if !mismatches.is_empty() {
                tracing::warn!(service = %service, ?mismatches, "Lookups disagree with their rebuild");
                report.services.insert(service, mismatches);
            }
        }
        for scope in self.registry.all_scopes() {
            if items % interval == 0 && cancel.is_cancelled() {
                return Ok(Completion::Incomplete(report));
            }
            items += 1;
            let mismatches = self.check_scope(conn, scope).await?;
            report.scopes_checked += 1;
            if !mismatches.is_empty() {
                tracing::warn!(scope = %scope, ?mismatches, "Cache scope disagrees with its rebuild");
                report.scopes.insert(scope, mismatches);
            }
        }
        tracing::info!(
            scopes = report.scopes_checked,
            services = report.services_checked,
            consistent = report.is_consistent(),
            "Consistency check finished"
        );
        Ok(Completion::Complete(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::counts::CountChanges;
    use crate::ids::{ContentStatus, FileServiceId, HashId};
    use crate::membership::MemoryMembership;

    const SERVICE: TagServiceId = TagServiceId(1);
    const DOMAIN: FileServiceId = FileServiceId(1);

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new().with_file_service(DOMAIN).unwrap().with_tag_service(SERVICE).unwrap()
    }

    async fn seeded(db: &Database, registry: &ServiceRegistry, membership: &MemoryMembership) {
        let storage = StorageMappingsCache::new(registry, membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        let hashes = BTreeSet::from([HashId(1), HashId(2)]);
        storage.add_mappings(&mut conn, &mut changes, SERVICE, TagId(7), &hashes).await.unwrap();
        changes.apply(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn incremental_state_is_consistent() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        membership.insert(DOMAIN, [HashId(1)]);
        seeded(&db, &registry, &membership).await;
        let checker = ConsistencyChecker::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let report = checker.check_all(&mut conn, &CancellationToken::new(), 10).await.unwrap();
        assert!(report.is_complete());
        let report = report.into_inner();
        assert!(report.is_consistent(), "{report:?}");
        assert_eq!((report.scopes_checked, report.services_checked), (2, 1));
    }

    #[tokio::test]
    async fn tampering_is_detected_and_left_in_place() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        membership.insert(DOMAIN, [HashId(1)]);
        seeded(&db, &registry, &membership).await;
        let mut conn = db.pool().acquire().await.unwrap();
        sqlx::query("UPDATE tag_counts SET current_count = 5 WHERE file_service_id = 1 AND display_type = 2")
            .execute(&mut *conn)
            .await
            .unwrap();
        let checker = ConsistencyChecker::new(&registry, &membership);
        let mismatches = checker.check_scope(&mut conn, MappingScope::new(DOMAIN, SERVICE)).await.unwrap();
        assert_eq!(mismatches, BTreeSet::from([Mismatch::DisplayCounts]));
        // The rebuild was rolled back.
        let counts = CountsStore::all_counts(&mut conn, TagDisplayType::Actual, MappingScope::new(DOMAIN, SERVICE))
            .await
            .unwrap();
        assert_eq!(counts[&TagId(7)], (5, 0));
    }

    #[tokio::test]
    async fn stale_lookups_are_reported() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let checker = ConsistencyChecker::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let siblings = DisplayCoordinator::new(&registry);
        siblings.siblings().add_edges(&mut conn, SERVICE, &[(TagId(1), TagId(2))], ContentStatus::Current).await.unwrap();
        let mismatches = checker.check_lookups(&mut conn, SERVICE).await.unwrap();
        assert!(mismatches.contains(&Mismatch::SiblingLookup(TagDisplayType::Actual)));
        siblings.regen(&mut conn, TagDisplayType::Ideal, SERVICE).await.unwrap();
        siblings.regen(&mut conn, TagDisplayType::Actual, SERVICE).await.unwrap();
        assert!(checker.check_lookups(&mut conn, SERVICE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_checks_are_incomplete() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let checker = ConsistencyChecker::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = checker.check_all(&mut conn, &cancel, 1).await.unwrap();
        assert_eq!(report, Completion::Incomplete(ConsistencyReport::default()));
    }
}
