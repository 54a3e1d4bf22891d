//! Display mapping caches: what every file shows after sibling and parent
//! resolution.
//!
//! A file displays `D` as current iff it carries, as current storage, any tag
//! implying `D`; the same goes independently for pending. Nothing here is
//! ever asserted directly: rows follow storage changes (one tag, many files)
//! and implication changes (one display tag, many implying tags).
//!
//! Every delta is computed as "files with the changed tags, minus files that
//! still have another path to the display tag", which is what keeps counts
//! from being added or subtracted twice.

use crate::counts::{CountChanges, CountsStore};
use crate::display::{DisplayCoordinator, ImplicationDelta};
use crate::error::{ErrorKind, Result};
use crate::filter::{Layer, MappingFilter};
use crate::ids::{ContentStatus, HashId, MappingScope, TagDisplayType, TagId};
use crate::scratch::{self, ScratchRole};
use crate::services::ServiceRegistry;
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::instrument;

/// Display rows only exist for these.
const DISPLAY_STATUSES: [ContentStatus; 2] = [ContentStatus::Current, ContentStatus::Pending];

#[derive(Debug, Clone, Copy)]
pub struct DisplayMappingsCache<'a> {
    coordinator: DisplayCoordinator<'a>,
}

impl<'a> DisplayMappingsCache<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { coordinator: DisplayCoordinator::new(registry) }
    }

    pub fn coordinator(&self) -> &DisplayCoordinator<'a> {
        &self.coordinator
    }

    /// For every display tag `tag` implies: the *other* storage tags implying it.
    ///
    /// Unchained tags only ever display as themselves, which needs no lookups.
    async fn implications(
        &self,
        conn: &mut SqliteConnection,
        scope: MappingScope,
        tag: TagId,
    ) -> Result<Vec<(TagId, BTreeSet<TagId>)>> {
        let service = scope.tag_service;
        if !self.coordinator.is_chained(conn, TagDisplayType::Actual, service, tag).await? {
            return Ok(vec![(tag, BTreeSet::new())]);
        }
        let implied = self.coordinator.implies(conn, TagDisplayType::Actual, service, tag).await?;
        let mut implications = Vec::with_capacity(implied.len());
        for display in implied {
            let mut others = self.coordinator.implied_by(conn, TagDisplayType::Actual, service, display).await?;
            others.remove(&tag);
            implications.push((display, others));
        }
        Ok(implications)
    }

    /// `tag` just gained `status` in storage on `hashes`.
    async fn gain(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        status: ContentStatus,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let storage = MappingFilter::new(Layer::Storage, scope, status);
        let mut total = 0;
        for (display, others) in self.implications(conn, scope, tag).await? {
            let addable = storage.untagged_within(conn, hashes, &others).await?;
            let added = Self::insert_rows(conn, scope, status, display, &addable).await?;
            record(changes, scope, status, display, added as i64);
            total += added;
        }
        Ok(total)
    }

    /// `tag` just lost `status` in storage on `hashes`.
    async fn lose(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        status: ContentStatus,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let storage = MappingFilter::new(Layer::Storage, scope, status);
        let mut total = 0;
        for (display, others) in self.implications(conn, scope, tag).await? {
            let removable = storage.untagged_within(conn, hashes, &others).await?;
            let removed = Self::delete_rows(conn, scope, status, display, &removable).await?;
            record(changes, scope, status, display, -(removed as i64));
            total += removed;
        }
        Ok(total)
    }

    pub async fn add_mappings_for_chained(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        self.gain(conn, changes, scope, ContentStatus::Current, tag, hashes).await
    }

    pub async fn delete_mappings_for_chained(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        self.lose(conn, changes, scope, ContentStatus::Current, tag, hashes).await
    }

    pub async fn pend_mappings_for_chained(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        self.gain(conn, changes, scope, ContentStatus::Pending, tag, hashes).await
    }

    pub async fn rescind_pending_mappings_for_chained(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        self.lose(conn, changes, scope, ContentStatus::Pending, tag, hashes).await
    }

    /// `implying` just started implying `display`. The lookups must already
    /// hold the new state.
    ///
    /// Files already showing `display` through some other implying tag are
    /// left alone.
    pub async fn add_implications(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        display: TagId,
        implying: &BTreeSet<TagId>,
    ) -> Result<u64> {
        if implying.is_empty() {
            return Ok(0);
        }
        let all = self.coordinator.implied_by(conn, TagDisplayType::Actual, scope.tag_service, display).await?;
        let others: BTreeSet<TagId> = all.difference(implying).copied().collect();
        let mut total = 0;
        for status in DISPLAY_STATUSES {
            let storage = MappingFilter::new(Layer::Storage, scope, status);
            let candidates = storage.tagged(conn, implying).await?;
            let addable = storage.untagged_within(conn, &candidates, &others).await?;
            let added = Self::insert_rows(conn, scope, status, display, &addable).await?;
            record(changes, scope, status, display, added as i64);
            total += added;
        }
        Ok(total)
    }

    /// `implying` just stopped implying `display`. The lookups must already
    /// hold the new state.
    ///
    /// Only files with no remaining path to `display` lose it.
    pub async fn delete_implications(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        display: TagId,
        implying: &BTreeSet<TagId>,
    ) -> Result<u64> {
        if implying.is_empty() {
            return Ok(0);
        }
        let remaining = self.coordinator.implied_by(conn, TagDisplayType::Actual, scope.tag_service, display).await?;
        let mut total = 0;
        for status in DISPLAY_STATUSES {
            let storage = MappingFilter::new(Layer::Storage, scope, status);
            let candidates = storage.tagged(conn, implying).await?;
            let removable = storage.untagged_within(conn, &candidates, &remaining).await?;
            let removed = Self::delete_rows(conn, scope, status, display, &removable).await?;
            record(changes, scope, status, display, -(removed as i64));
            total += removed;
        }
        Ok(total)
    }

    /// Bring one scope's rows in line with a regenerated view.
    ///
    /// Removals go first: a file that swapped one implying tag for another
    /// keeps its row either way, and counting it out before counting it back
    /// in never reduces a row that isn't there.
    #[instrument(level = "debug", skip_all, fields(scope = %scope))]
    pub async fn apply_delta(
        &self,
        conn: &mut SqliteConnection,
        changes: &mut CountChanges,
        scope: MappingScope,
        delta: &ImplicationDelta,
    ) -> Result<()> {
        for (display, implying) in &delta.removed {
            self.delete_implications(conn, changes, scope, *display, implying).await?;
        }
        for (display, implying) in &delta.added {
            self.add_implications(conn, changes, scope, *display, implying).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Rebuild a scope's display rows and counts from its storage rows.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn generate(&self, conn: &mut SqliteConnection, scope: MappingScope) -> Result<u64> {
        sqlx::query("DELETE FROM display_mappings WHERE file_service_id = ? AND tag_service_id = ?")
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let rows = self.copy_from_storage(conn, scope, &DISPLAY_STATUSES).await?;
        CountsStore::recount(conn, Layer::Display, scope).await?;
        tracing::info!(scope = %scope, rows, "Generated display mappings");
        Ok(rows)
    }

    /// Rebuild only a scope's pending display rows.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn regenerate_pending(&self, conn: &mut SqliteConnection, scope: MappingScope) -> Result<u64> {
        sqlx::query("DELETE FROM display_mappings WHERE file_service_id = ? AND tag_service_id = ? AND status = ?")
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(ContentStatus::Pending.as_db())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let rows = self.copy_from_storage(conn, scope, &[ContentStatus::Pending]).await?;
        CountsStore::recount(conn, Layer::Display, scope).await?;
        tracing::info!(scope = %scope, rows, "Regenerated pending display mappings");
        Ok(rows)
    }

    async fn copy_from_storage(
        &self,
        conn: &mut SqliteConnection,
        scope: MappingScope,
        statuses: &[ContentStatus],
    ) -> Result<u64> {
        let view = self.coordinator.snapshot(conn, TagDisplayType::Actual, scope.tag_service).await?;
        let tags: Vec<i64> = sqlx::query_scalar(
            r#"
                SELECT DISTINCT tag_id FROM storage_mappings
                WHERE file_service_id = ? AND tag_service_id = ? AND status IN (?, ?)
            "#,
        )
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .bind(ContentStatus::Current.as_db())
        .bind(ContentStatus::Pending.as_db())
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        let mut rows = 0;
        for tag in tags.into_iter().map(TagId) {
            for display in view.implies(tag) {
                for status in statuses {
                    let result = sqlx::query(
                        r#"
                            INSERT OR IGNORE INTO display_mappings
                                (file_service_id, tag_service_id, status, tag_id, hash_id)
                            SELECT file_service_id, tag_service_id, status, ?, hash_id
                            FROM storage_mappings
                            WHERE file_service_id = ? AND tag_service_id = ? AND tag_id = ? AND status = ?
                        "#,
                    )
                    .bind(display.0)
                    .bind(scope.file_service.0)
                    .bind(scope.tag_service.0)
                    .bind(tag.0)
                    .bind(status.as_db())
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                    rows += result.rows_affected();
                }
            }
        }
        Ok(rows)
    }

    // =========================================================================
    // Rows
    // =========================================================================

    async fn insert_rows(
        conn: &mut SqliteConnection,
        scope: MappingScope,
        status: ContentStatus,
        display: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        scratch::fill(conn, ScratchRole::Filter, hashes.iter().map(|hash| hash.0)).await?;
        let result = sqlx::query(
            r#"
                INSERT OR IGNORE INTO display_mappings (file_service_id, tag_service_id, status, tag_id, hash_id)
                SELECT ?, ?, ?, ?, id FROM temp.scratch_filter
            "#,
        )
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .bind(status.as_db())
        .bind(display.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    async fn delete_rows(
        conn: &mut SqliteConnection,
        scope: MappingScope,
        status: ContentStatus,
        display: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        scratch::fill(conn, ScratchRole::Filter, hashes.iter().map(|hash| hash.0)).await?;
        let result = sqlx::query(
            r#"
                DELETE FROM display_mappings
                WHERE file_service_id = ? AND tag_service_id = ? AND status = ? AND tag_id = ?
                    AND hash_id IN (SELECT id FROM temp.scratch_filter)
            "#,
        )
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .bind(status.as_db())
        .bind(display.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }
}

fn record(changes: &mut CountChanges, scope: MappingScope, status: ContentStatus, display: TagId, delta: i64) {
    match status {
        ContentStatus::Current => changes.record(TagDisplayType::Actual, scope, display, delta, 0),
        ContentStatus::Pending => changes.record(TagDisplayType::Actual, scope, display, 0, delta),
        ContentStatus::Deleted | ContentStatus::Petitioned => {},
    }
}
