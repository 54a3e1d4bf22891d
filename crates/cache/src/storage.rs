//! Storage mapping caches: the literal tag assertions per file domain.
//!
//! The combined file scope of each tag service holds the raw assertions.
//! Every real file domain holds a membership-filtered copy of it. Each
//! change is applied to the raw layer first and then fanned out to the
//! domains the affected files belong to, with membership asked once per call.

use crate::counts::{CountChanges, CountsStore};
use crate::display_mappings::DisplayMappingsCache;
use crate::error::{Error, ErrorKind, Result};
use crate::filter::Layer;
use crate::ids::{ContentStatus, FileServiceId, HashId, MappingScope, TagDisplayType, TagId, TagServiceId};
use crate::membership::{FileDomainMembership, MembershipError};
use crate::models::{CountRow, MappingRow};
use crate::scratch::{self, ScratchRole};
use crate::services::ServiceRegistry;
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::instrument;

/// A change to one (tag, file) storage mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MappingOp {
    Add,
    Delete,
    Pend,
    Rescind,
}

impl MappingOp {
    /// The row a mapping ends up as, given the row it had (`None` for no row).
    ///
    /// Storage rows are only ever current, deleted or pending. Adding or
    /// deleting a pending mapping rescinds the pend on the way.
    pub fn transition(self, old: Option<ContentStatus>) -> Option<ContentStatus> {
        match (self, old) {
            (Self::Add, _) => Some(ContentStatus::Current),
            (Self::Delete, _) => Some(ContentStatus::Deleted),
            (Self::Pend, None | Some(ContentStatus::Deleted)) => Some(ContentStatus::Pending),
            (Self::Pend, old) => old,
            (Self::Rescind, Some(ContentStatus::Pending)) => None,
            (Self::Rescind, old) => old,
        }
    }
}

/// Files whose counted state moved during one change to one scope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transitions {
    pub current_gained: BTreeSet<HashId>,
    pub current_lost: BTreeSet<HashId>,
    pub pending_gained: BTreeSet<HashId>,
    pub pending_lost: BTreeSet<HashId>,
    /// Rows written or removed, including ones that aren't counted (deleted).
    pub rows: u64,
}

impl Transitions {
    fn track(&mut self, hash: HashId, old: Option<ContentStatus>, new: Option<ContentStatus>) {
        let was = |status| old == Some(status);
        let is = |status| new == Some(status);
        match (was(ContentStatus::Current), is(ContentStatus::Current)) {
            (false, true) => {
                self.current_gained.insert(hash);
            },
            (true, false) => {
                self.current_lost.insert(hash);
            },
            _ => {},
        }
        match (was(ContentStatus::Pending), is(ContentStatus::Pending)) {
            (false, true) => {
                self.pending_gained.insert(hash);
            },
            (true, false) => {
                self.pending_lost.insert(hash);
            },
            _ => {},
        }
        self.rows += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    fn current_delta(&self) -> i64 {
        self.current_gained.len() as i64 - self.current_lost.len() as i64
    }

    fn pending_delta(&self) -> i64 {
        self.pending_gained.len() as i64 - self.pending_lost.len() as i64
    }
}

pub(crate) fn membership_error(err: MembershipError) -> Error {
    tracing::warn!(error = %err, "File domain membership lookup failed");
    exn::Exn::from(ErrorKind::Membership)
}

#[derive(Clone, Copy)]
pub struct StorageMappingsCache<'a> {
    registry: &'a ServiceRegistry,
    membership: &'a dyn FileDomainMembership,
    display: DisplayMappingsCache<'a>,
}

impl<'a> StorageMappingsCache<'a> {
    pub fn new(registry: &'a ServiceRegistry, membership: &'a dyn FileDomainMembership) -> Self {
        Self { registry, membership, display: DisplayMappingsCache::new(registry) }
    }

    pub fn display(&self) -> &DisplayMappingsCache<'a> {
        &self.display
    }

    // =========================================================================
    // Tag-centric changes
    // =========================================================================

    pub async fn add_mappings(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        self.apply(conn, changes, MappingOp::Add, service, tag, hashes).await
    }

    pub async fn delete_mappings(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        self.apply(conn, changes, MappingOp::Delete, service, tag, hashes).await
    }

    pub async fn pend_mappings(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        self.apply(conn, changes, MappingOp::Pend, service, tag, hashes).await
    }

    pub async fn rescind_pending_mappings(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        self.apply(conn, changes, MappingOp::Rescind, service, tag, hashes).await
    }

    /// Apply `op` to the raw layer, then to every file domain holding any of
    /// `hashes`. Returns what happened in the raw layer.
    #[instrument(level = "debug", skip_all, fields(op = ?op, service = %service, tag = %tag, files = hashes.len()))]
    pub async fn apply(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        op: MappingOp,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        if hashes.is_empty() {
            return Ok(Transitions::default());
        }
        let domains: Vec<FileServiceId> = self.registry.file_services().collect();
        let grouped = match domains.is_empty() {
            true => BTreeMap::new(),
            false => self.membership.group_by_domain(&domains, hashes).await.map_err(membership_error)?,
        };
        let raw = self.apply_to_scope(conn, changes, op, MappingScope::combined(service), tag, hashes).await?;
        for (domain, members) in grouped {
            // Unregistered domains coming back from the collaborator are ignored.
            if !self.registry.has_file_service(domain) || domain.is_combined() {
                continue;
            }
            self.apply_to_scope(conn, changes, op, MappingScope::new(domain, service), tag, &members).await?;
        }
        Ok(raw)
    }

    async fn apply_to_scope(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        op: MappingOp,
        scope: MappingScope,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        let existing = Self::statuses(conn, scope, tag, hashes).await?;
        let mut transitions = Transitions::default();
        let mut writes: BTreeMap<Option<ContentStatus>, BTreeSet<HashId>> = BTreeMap::new();
        for hash in hashes {
            let old = existing.get(hash).copied();
            let new = op.transition(old);
            if new != old {
                transitions.track(*hash, old, new);
                writes.entry(new).or_default().insert(*hash);
            }
        }
        for (status, hashes) in &writes {
            Self::write_rows(conn, scope, tag, *status, hashes).await?;
        }
        changes.record(
            TagDisplayType::Storage,
            scope,
            tag,
            transitions.current_delta(),
            transitions.pending_delta(),
        );
        // Losses first so a pending -> current move never has both rows at once.
        self.display.rescind_pending_mappings_for_chained(conn, changes, scope, tag, &transitions.pending_lost).await?;
        self.display.delete_mappings_for_chained(conn, changes, scope, tag, &transitions.current_lost).await?;
        self.display.add_mappings_for_chained(conn, changes, scope, tag, &transitions.current_gained).await?;
        self.display.pend_mappings_for_chained(conn, changes, scope, tag, &transitions.pending_gained).await?;
        tracing::trace!(scope = %scope, tag = %tag, rows = transitions.rows, "Applied storage change");
        Ok(transitions)
    }

    async fn statuses(
        conn: &mut SqliteConnection,
        scope: MappingScope,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<BTreeMap<HashId, ContentStatus>> {
        scratch::fill(conn, ScratchRole::Hashes, hashes.iter().map(|hash| hash.0)).await?;
        let rows: Vec<MappingRow> = sqlx::query_as(
            r#"
                SELECT tag_id, hash_id, status FROM storage_mappings
                WHERE file_service_id = ? AND tag_service_id = ? AND tag_id = ?
                    AND hash_id IN (SELECT id FROM temp.scratch_hashes)
            "#,
        )
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .bind(tag.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter()
            .map(|row| <(TagId, HashId, ContentStatus)>::try_from(row).map(|(_, hash, status)| (hash, status)))
            .collect()
    }

    async fn write_rows(
        conn: &mut SqliteConnection,
        scope: MappingScope,
        tag: TagId,
        status: Option<ContentStatus>,
        hashes: &BTreeSet<HashId>,
    ) -> Result<()> {
        scratch::fill(conn, ScratchRole::Filter, hashes.iter().map(|hash| hash.0)).await?;
        let query = match status {
            None => sqlx::query(
                r#"
                    DELETE FROM storage_mappings
                    WHERE file_service_id = ? AND tag_service_id = ? AND tag_id = ?
                        AND hash_id IN (SELECT id FROM temp.scratch_filter)
                "#,
            )
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(tag.0),
            Some(status) => sqlx::query(
                r#"
                    INSERT INTO storage_mappings (file_service_id, tag_service_id, tag_id, hash_id, status)
                    SELECT ?, ?, ?, id, ? FROM temp.scratch_filter WHERE true
                    ON CONFLICT (file_service_id, tag_service_id, tag_id, hash_id) DO UPDATE SET status = excluded.status
                "#,
            )
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(tag.0)
            .bind(status.as_db()),
        };
        query.execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Petitions
    // =========================================================================

    /// Record petitions against mappings. Petitions never change what a file
    /// carries or any count.
    pub async fn petition_mappings(
        &self,
        conn: &mut SqliteConnection,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        scratch::fill(conn, ScratchRole::Filter, hashes.iter().map(|hash| hash.0)).await?;
        let result = sqlx::query(
            r#"
                INSERT OR IGNORE INTO petitioned_mappings (tag_service_id, tag_id, hash_id)
                SELECT ?, ?, id FROM temp.scratch_filter
            "#,
        )
        .bind(service.0)
        .bind(tag.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    pub async fn rescind_petitioned_mappings(
        &self,
        conn: &mut SqliteConnection,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        scratch::fill(conn, ScratchRole::Filter, hashes.iter().map(|hash| hash.0)).await?;
        let result = sqlx::query(
            r#"
                DELETE FROM petitioned_mappings
                WHERE tag_service_id = ? AND tag_id = ? AND hash_id IN (SELECT id FROM temp.scratch_filter)
            "#,
        )
        .bind(service.0)
        .bind(tag.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    pub async fn petitioned(
        &self,
        conn: &mut SqliteConnection,
        service: TagServiceId,
        tag: TagId,
    ) -> Result<BTreeSet<HashId>> {
        let hashes: Vec<i64> =
            sqlx::query_scalar("SELECT hash_id FROM petitioned_mappings WHERE tag_service_id = ? AND tag_id = ?")
                .bind(service.0)
                .bind(tag.0)
                .fetch_all(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        Ok(hashes.into_iter().map(HashId).collect())
    }

    // =========================================================================
    // File-centric changes
    // =========================================================================

    /// Copy everything the raw layer holds for `hashes` into `domain`.
    ///
    /// Only files the membership collaborator places in `domain` are copied,
    /// and only the rows the domain is still missing: a file may already
    /// hold rows fanned out to it by earlier mapping changes. Returns the
    /// number of storage rows copied, summed over tag services.
    #[instrument(skip_all, fields(domain = %domain, files = hashes.len()))]
    pub async fn add_files(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        domain: FileServiceId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        if domain.is_combined() {
            exn::bail!(ErrorKind::CombinedService);
        }
        self.registry.require_file_service(domain)?;
        let members = self
            .membership
            .group_by_domain(&[domain], hashes)
            .await
            .map_err(membership_error)?
            .remove(&domain)
            .unwrap_or_default();
        if members.is_empty() {
            return Ok(0);
        }
        scratch::fill(conn, ScratchRole::Filter, members.iter().map(|hash| hash.0)).await?;
        let mut copied = 0;
        for service in self.registry.tag_services() {
            let scope = MappingScope::new(domain, service);
            for layer in [Layer::Storage, Layer::Display] {
                for (tag, current, pending) in Self::missing_counts(conn, layer, scope).await? {
                    changes.record(layer.display_type(), scope, tag, current as i64, pending as i64);
                }
                let rows = Self::copy_filtered(conn, layer, scope).await?;
                if layer == Layer::Storage {
                    copied += rows;
                }
            }
        }
        Ok(copied)
    }

    /// Remove every storage and display row `hashes` have in `domain`.
    #[instrument(skip_all, fields(domain = %domain, files = hashes.len()))]
    pub async fn delete_files(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        domain: FileServiceId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        if domain.is_combined() {
            exn::bail!(ErrorKind::CombinedService);
        }
        if !self.registry.has_file_service(domain) {
            tracing::debug!(domain = %domain, "Ignoring file removal from unknown domain");
            return Ok(0);
        }
        if hashes.is_empty() {
            return Ok(0);
        }
        scratch::fill(conn, ScratchRole::Filter, hashes.iter().map(|hash| hash.0)).await?;
        let mut removed = 0;
        for service in self.registry.tag_services() {
            let scope = MappingScope::new(domain, service);
            for layer in [Layer::Storage, Layer::Display] {
                for (tag, current, pending) in Self::filtered_counts(conn, layer, scope).await? {
                    changes.record(layer.display_type(), scope, tag, -(current as i64), -(pending as i64));
                }
                let sql = format!(
                    r#"
                        DELETE FROM {table}
                        WHERE file_service_id = ? AND tag_service_id = ?
                            AND hash_id IN (SELECT id FROM temp.scratch_filter)
                    "#,
                    table = layer.table(),
                );
                let result = sqlx::query(&sql)
                    .bind(scope.file_service.0)
                    .bind(scope.tag_service.0)
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                if layer == Layer::Storage {
                    removed += result.rows_affected();
                }
            }
        }
        Ok(removed)
    }

    /// Per-tag counts of the raw `layer` rows on the files in the filter set
    /// that `scope` doesn't hold yet: exactly what
    /// [`copy_filtered`](Self::copy_filtered) is about to insert.
    async fn missing_counts(
        conn: &mut SqliteConnection,
        layer: Layer,
        scope: MappingScope,
    ) -> Result<Vec<(TagId, u64, u64)>> {
        // Same key as the layer's primary key, so the insert ignores the same rows.
        let same_row = match layer {
            Layer::Storage => "l.tag_id = r.tag_id AND l.hash_id = r.hash_id",
            Layer::Display => "l.status = r.status AND l.tag_id = r.tag_id AND l.hash_id = r.hash_id",
        };
        let sql = format!(
            r#"
                SELECT r.tag_id, SUM(r.status = ?3) AS current_count, SUM(r.status = ?4) AS pending_count
                FROM {table} r
                WHERE r.file_service_id = 0 AND r.tag_service_id = ?2 AND r.status IN (?3, ?4)
                    AND r.hash_id IN (SELECT id FROM temp.scratch_filter)
                    AND NOT EXISTS (
                        SELECT 1 FROM {table} l
                        WHERE l.file_service_id = ?1 AND l.tag_service_id = ?2 AND {same_row}
                    )
                GROUP BY r.tag_id
            "#,
            table = layer.table(),
        );
        let rows: Vec<CountRow> = sqlx::query_as(&sql)
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(ContentStatus::Current.as_db())
            .bind(ContentStatus::Pending.as_db())
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(<(TagId, u64, u64)>::try_from).collect()
    }

    /// Per-tag counts of `layer` rows in `scope` on the files in the filter set.
    async fn filtered_counts(
        conn: &mut SqliteConnection,
        layer: Layer,
        scope: MappingScope,
    ) -> Result<Vec<(TagId, u64, u64)>> {
        let sql = format!(
            r#"
                SELECT tag_id, SUM(status = ?3) AS current_count, SUM(status = ?4) AS pending_count
                FROM {table}
                WHERE file_service_id = ?1 AND tag_service_id = ?2 AND status IN (?3, ?4)
                    AND hash_id IN (SELECT id FROM temp.scratch_filter)
                GROUP BY tag_id
            "#,
            table = layer.table(),
        );
        let rows: Vec<CountRow> = sqlx::query_as(&sql)
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(ContentStatus::Current.as_db())
            .bind(ContentStatus::Pending.as_db())
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(<(TagId, u64, u64)>::try_from).collect()
    }

    /// Copy the raw rows of the files in the filter set into `scope`.
    async fn copy_filtered(conn: &mut SqliteConnection, layer: Layer, scope: MappingScope) -> Result<u64> {
        let sql = match layer {
            Layer::Storage => r#"
                INSERT OR IGNORE INTO storage_mappings (file_service_id, tag_service_id, tag_id, hash_id, status)
                SELECT ?1, tag_service_id, tag_id, hash_id, status FROM storage_mappings
                WHERE file_service_id = 0 AND tag_service_id = ?2
                    AND hash_id IN (SELECT id FROM temp.scratch_filter)
            "#,
            Layer::Display => r#"
                INSERT OR IGNORE INTO display_mappings (file_service_id, tag_service_id, status, tag_id, hash_id)
                SELECT ?1, tag_service_id, status, tag_id, hash_id FROM display_mappings
                WHERE file_service_id = 0 AND tag_service_id = ?2
                    AND hash_id IN (SELECT id FROM temp.scratch_filter)
            "#,
        };
        let result = sqlx::query(sql)
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Rebuild a scope's storage rows and counts.
    ///
    /// A real domain is recopied from the raw layer through current
    /// membership. The combined scope *is* the raw layer, so only its counts
    /// are rebuilt.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn generate(&self, conn: &mut SqliteConnection, scope: MappingScope) -> Result<u64> {
        let mut rows = 0;
        if !scope.file_service.is_combined() {
            self.registry.require_file_service(scope.file_service)?;
            sqlx::query("DELETE FROM storage_mappings WHERE file_service_id = ? AND tag_service_id = ?")
                .bind(scope.file_service.0)
                .bind(scope.tag_service.0)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
            let members = self.membership.current_hash_ids(scope.file_service).await.map_err(membership_error)?;
            scratch::fill(conn, ScratchRole::Filter, members.iter().map(|hash| hash.0)).await?;
            rows = Self::copy_filtered(conn, Layer::Storage, scope).await?;
        }
        CountsStore::recount(conn, Layer::Storage, scope).await?;
        tracing::info!(scope = %scope, rows, "Generated storage mappings");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::filter::MappingFilter;
    use crate::membership::MemoryMembership;
    use rstest::rstest;

    const SERVICE: TagServiceId = TagServiceId(1);
    const DOMAIN: FileServiceId = FileServiceId(1);
    const RAW: MappingScope = MappingScope { file_service: FileServiceId(0), tag_service: SERVICE };
    const LOCAL: MappingScope = MappingScope { file_service: DOMAIN, tag_service: SERVICE };
    const CAT: TagId = TagId(2);

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new().with_file_service(DOMAIN).unwrap().with_tag_service(SERVICE).unwrap()
    }

    fn h(ids: &[i64]) -> BTreeSet<HashId> {
        ids.iter().copied().map(HashId).collect()
    }

    async fn counts(conn: &mut SqliteConnection, scope: MappingScope) -> BTreeMap<TagId, (u64, u64)> {
        CountsStore::all_counts(conn, TagDisplayType::Storage, scope).await.unwrap()
    }

    async fn carrying(conn: &mut SqliteConnection, scope: MappingScope, status: ContentStatus) -> BTreeSet<HashId> {
        MappingFilter::new(Layer::Storage, scope, status).tagged(conn, &BTreeSet::from([CAT])).await.unwrap()
    }

    #[rstest]
    #[case(MappingOp::Add, None, Some(ContentStatus::Current))]
    #[case(MappingOp::Add, Some(ContentStatus::Deleted), Some(ContentStatus::Current))]
    #[case(MappingOp::Add, Some(ContentStatus::Pending), Some(ContentStatus::Current))]
    #[case(MappingOp::Delete, None, Some(ContentStatus::Deleted))]
    #[case(MappingOp::Delete, Some(ContentStatus::Current), Some(ContentStatus::Deleted))]
    #[case(MappingOp::Delete, Some(ContentStatus::Pending), Some(ContentStatus::Deleted))]
    #[case(MappingOp::Pend, None, Some(ContentStatus::Pending))]
    #[case(MappingOp::Pend, Some(ContentStatus::Deleted), Some(ContentStatus::Pending))]
    #[case(MappingOp::Pend, Some(ContentStatus::Current), Some(ContentStatus::Current))]
    #[case(MappingOp::Pend, Some(ContentStatus::Pending), Some(ContentStatus::Pending))]
    #[case(MappingOp::Rescind, Some(ContentStatus::Pending), None)]
    #[case(MappingOp::Rescind, Some(ContentStatus::Current), Some(ContentStatus::Current))]
    #[case(MappingOp::Rescind, None, None)]
    fn transitions(#[case] op: MappingOp, #[case] old: Option<ContentStatus>, #[case] new: Option<ContentStatus>) {
        assert_eq!(op.transition(old), new);
    }

    #[tokio::test]
    async fn changes_fan_out_to_member_domains() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        membership.insert(DOMAIN, [HashId(1), HashId(2)]);
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        cache.add_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1, 3])).await.unwrap();
        cache.pend_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[2])).await.unwrap();
        changes.apply(&mut conn).await.unwrap();

        assert_eq!(carrying(&mut conn, RAW, ContentStatus::Current).await, h(&[1, 3]));
        assert_eq!(carrying(&mut conn, LOCAL, ContentStatus::Current).await, h(&[1]));
        assert_eq!(carrying(&mut conn, LOCAL, ContentStatus::Pending).await, h(&[2]));
        assert_eq!(counts(&mut conn, RAW).await[&CAT], (2, 1));
        assert_eq!(counts(&mut conn, LOCAL).await[&CAT], (1, 1));
    }

    #[tokio::test]
    async fn rescinding_an_unpended_mapping_is_a_no_op() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        cache.add_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1])).await.unwrap();
        let rescinded = cache.rescind_pending_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1])).await.unwrap();
        assert!(rescinded.is_empty());
        let first = cache.pend_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[2])).await.unwrap();
        let second = cache.pend_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[2])).await.unwrap();
        assert_eq!(first.pending_gained, h(&[2]));
        assert!(second.is_empty());
        changes.apply(&mut conn).await.unwrap();
        assert_eq!(counts(&mut conn, RAW).await[&CAT], (1, 1));
    }

    #[tokio::test]
    async fn adding_a_pending_mapping_moves_it() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        cache.pend_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1])).await.unwrap();
        changes.apply(&mut conn).await.unwrap();
        let mut changes = CountChanges::new();
        let moved = cache.add_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1])).await.unwrap();
        assert_eq!((moved.current_gained, moved.pending_lost), (h(&[1]), h(&[1])));
        changes.apply(&mut conn).await.unwrap();
        assert_eq!(counts(&mut conn, RAW).await[&CAT], (1, 0));
        let display = CountsStore::all_counts(&mut conn, TagDisplayType::Actual, RAW).await.unwrap();
        assert_eq!(display[&CAT], (1, 0));
    }

    #[tokio::test]
    async fn files_entering_and_leaving_a_domain() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        cache.add_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1, 2])).await.unwrap();
        cache.pend_mappings(&mut conn, &mut changes, SERVICE, TagId(5), &h(&[1])).await.unwrap();
        changes.apply(&mut conn).await.unwrap();
        assert!(counts(&mut conn, LOCAL).await.is_empty());

        membership.insert(DOMAIN, [HashId(1)]);
        let mut changes = CountChanges::new();
        assert_eq!(cache.add_files(&mut conn, &mut changes, DOMAIN, &h(&[1, 2])).await.unwrap(), 2);
        // Already copied: nothing happens twice.
        assert_eq!(cache.add_files(&mut conn, &mut changes, DOMAIN, &h(&[1])).await.unwrap(), 0);
        changes.apply(&mut conn).await.unwrap();
        assert_eq!(counts(&mut conn, LOCAL).await, BTreeMap::from([(CAT, (1, 0)), (TagId(5), (0, 1))]));
        let display = CountsStore::all_counts(&mut conn, TagDisplayType::Actual, LOCAL).await.unwrap();
        assert_eq!(display, BTreeMap::from([(CAT, (1, 0)), (TagId(5), (0, 1))]));

        let mut changes = CountChanges::new();
        assert_eq!(cache.delete_files(&mut conn, &mut changes, DOMAIN, &h(&[1])).await.unwrap(), 2);
        let applied = changes.apply(&mut conn).await.unwrap();
        assert_eq!(applied.zeroed.len(), 4);
        assert!(counts(&mut conn, LOCAL).await.is_empty());
        assert_eq!(counts(&mut conn, RAW).await[&CAT], (2, 0));
    }

    #[tokio::test]
    async fn entering_file_gets_rows_it_was_missing() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        cache.add_mappings(&mut conn, &mut changes, SERVICE, TagId(5), &h(&[1])).await.unwrap();
        changes.apply(&mut conn).await.unwrap();

        // Already a member when cat lands on it, so cat fans out before the
        // file is announced.
        membership.insert(DOMAIN, [HashId(1)]);
        let mut changes = CountChanges::new();
        cache.add_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1])).await.unwrap();
        changes.apply(&mut conn).await.unwrap();
        assert_eq!(counts(&mut conn, LOCAL).await, BTreeMap::from([(CAT, (1, 0))]));

        let mut changes = CountChanges::new();
        assert_eq!(cache.add_files(&mut conn, &mut changes, DOMAIN, &h(&[1])).await.unwrap(), 1);
        changes.apply(&mut conn).await.unwrap();
        let expected = BTreeMap::from([(CAT, (1, 0)), (TagId(5), (1, 0))]);
        assert_eq!(counts(&mut conn, LOCAL).await, expected);
        assert_eq!(counts(&mut conn, LOCAL).await, counts(&mut conn, RAW).await);
        let display = CountsStore::all_counts(&mut conn, TagDisplayType::Actual, LOCAL).await.unwrap();
        assert_eq!(display, expected);
    }

    #[tokio::test]
    async fn generate_recopies_through_membership() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        membership.insert(DOMAIN, [HashId(2)]);
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        cache.add_mappings(&mut conn, &mut changes, SERVICE, CAT, &h(&[1, 2, 3])).await.unwrap();
        changes.apply(&mut conn).await.unwrap();
        membership.insert(DOMAIN, [HashId(3)]);
        assert_eq!(cache.generate(&mut conn, LOCAL).await.unwrap(), 2);
        assert_eq!(carrying(&mut conn, LOCAL, ContentStatus::Current).await, h(&[2, 3]));
        assert_eq!(counts(&mut conn, LOCAL).await[&CAT], (2, 0));
        assert_eq!(cache.generate(&mut conn, RAW).await.unwrap(), 0);
        assert_eq!(counts(&mut conn, RAW).await[&CAT], (3, 0));
    }

    #[tokio::test]
    async fn petitions_leave_counts_alone() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(cache.petition_mappings(&mut conn, SERVICE, CAT, &h(&[1, 2])).await.unwrap(), 2);
        assert_eq!(cache.petition_mappings(&mut conn, SERVICE, CAT, &h(&[2])).await.unwrap(), 0);
        assert_eq!(cache.rescind_petitioned_mappings(&mut conn, SERVICE, CAT, &h(&[1])).await.unwrap(), 1);
        assert_eq!(cache.petitioned(&mut conn, SERVICE, CAT).await.unwrap(), h(&[2]));
        assert!(counts(&mut conn, RAW).await.is_empty());
    }

    #[tokio::test]
    async fn combined_domain_is_not_a_file_domain() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let membership = MemoryMembership::new();
        let cache = StorageMappingsCache::new(&registry, &membership);
        let mut conn = db.pool().acquire().await.unwrap();
        let mut changes = CountChanges::new();
        let err = cache.add_files(&mut conn, &mut changes, FileServiceId::COMBINED, &h(&[1])).await.unwrap_err();
        assert_eq!(*err, ErrorKind::CombinedService);
        let err = cache.add_files(&mut conn, &mut changes, FileServiceId(9), &h(&[1])).await.unwrap_err();
        assert_eq!(*err, ErrorKind::FileServiceNotFound(FileServiceId(9)));
        assert_eq!(cache.delete_files(&mut conn, &mut changes, FileServiceId(9), &h(&[1])).await.unwrap(), 0);
    }
}
