//! Membership-filtered joins over the mapping tables.
//!
//! Two questions come up over and over again while maintaining the caches:
//!
//! - which of these files carry any of these tags (with a given status)?
//! - which of these files carry none of these tags?
//!
//! Both have a file-driven and a tag-driven answer. [`planner`](crate::planner)
//! picks one from row estimates; the `CROSS JOIN`s below pin SQLite to the
//! chosen driving side, since SQLite never reorders the operands of a
//! `CROSS JOIN`.

use crate::counts::CountsStore;
use crate::error::{ErrorKind, Result};
use crate::ids::{ContentStatus, HashId, MappingScope, TagDisplayType, TagId};
use crate::planner::{self, ExclusionStrategy, JoinDriver};
use crate::scratch::{self, ScratchRole};
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;

/// Which mapping table a join reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Layer {
    Storage,
    Display,
}

impl Layer {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Storage => "storage_mappings",
            Self::Display => "display_mappings",
        }
    }

    /// The count scope whose numbers estimate this layer's row counts.
    pub(crate) fn display_type(&self) -> TagDisplayType {
        match self {
            Self::Storage => TagDisplayType::Storage,
            Self::Display => TagDisplayType::Actual,
        }
    }
}

/// Files carrying `tags` with `status` in one scope of one layer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MappingFilter {
    pub(crate) layer: Layer,
    pub(crate) scope: MappingScope,
    pub(crate) status: ContentStatus,
}

impl MappingFilter {
    pub(crate) fn new(layer: Layer, scope: MappingScope, status: ContentStatus) -> Self {
        Self { layer, scope, status }
    }

    /// Estimated number of rows carrying any of `tags`.
    async fn tag_weight(&self, conn: &mut SqliteConnection, tags: &BTreeSet<TagId>) -> Result<u64> {
        CountsStore::weight(conn, self.layer.display_type(), self.scope, self.status, tags).await
    }

    /// Every file in the scope carrying any of `tags`.
    pub(crate) async fn tagged(&self, conn: &mut SqliteConnection, tags: &BTreeSet<TagId>) -> Result<BTreeSet<HashId>> {
        if tags.is_empty() {
            return Ok(BTreeSet::new());
        }
        scratch::fill(conn, ScratchRole::Tags, tags.iter().map(|tag| tag.0)).await?;
        let sql = format!(
            r#"
                SELECT DISTINCT m.hash_id
                FROM temp.scratch_tags t CROSS JOIN {table} m
                WHERE m.file_service_id = ? AND m.tag_service_id = ? AND m.tag_id = t.id AND m.status = ?
            "#,
            table = self.layer.table(),
        );
        self.fetch_hashes(conn, &sql).await
    }

    /// The files among `hashes` carrying any of `tags`.
    pub(crate) async fn tagged_within(
        &self,
        conn: &mut SqliteConnection,
        hashes: &BTreeSet<HashId>,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<HashId>> {
        if hashes.is_empty() || tags.is_empty() {
            return Ok(BTreeSet::new());
        }
        let tag_weight = self.tag_weight(conn, tags).await?;
        scratch::fill(conn, ScratchRole::Hashes, hashes.iter().map(|hash| hash.0)).await?;
        scratch::fill(conn, ScratchRole::Tags, tags.iter().map(|tag| tag.0)).await?;
        let driver = planner::join_driver(hashes.len() as u64, tag_weight);
        let sql = match driver {
            JoinDriver::Files => format!(
                r#"
                    SELECT DISTINCT m.hash_id
                    FROM temp.scratch_hashes h CROSS JOIN {table} m
                    WHERE m.file_service_id = ? AND m.tag_service_id = ? AND m.hash_id = h.id AND m.status = ?
                        AND m.tag_id IN (SELECT id FROM temp.scratch_tags)
                "#,
                table = self.layer.table(),
            ),
            JoinDriver::Tags => format!(
                r#"
                    SELECT DISTINCT m.hash_id
                    FROM temp.scratch_tags t CROSS JOIN {table} m
                    WHERE m.file_service_id = ? AND m.tag_service_id = ? AND m.tag_id = t.id AND m.status = ?
                        AND m.hash_id IN (SELECT id FROM temp.scratch_hashes)
                "#,
                table = self.layer.table(),
            ),
        };
        tracing::trace!(?driver, files = hashes.len(), tag_weight, "Filtered join");
        self.fetch_hashes(conn, &sql).await
    }

    /// The files among `hashes` carrying none of `excluded`.
    pub(crate) async fn untagged_within(
        &self,
        conn: &mut SqliteConnection,
        hashes: &BTreeSet<HashId>,
        excluded: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<HashId>> {
        if hashes.is_empty() || excluded.is_empty() {
            return Ok(hashes.clone());
        }
        let exclusion_weight = self.tag_weight(conn, excluded).await?;
        let strategy = planner::choose_exclusion_strategy(hashes.len() as u64, exclusion_weight);
        scratch::fill(conn, ScratchRole::Hashes, hashes.iter().map(|hash| hash.0)).await?;
        scratch::fill(conn, ScratchRole::Exclusion, excluded.iter().map(|tag| tag.0)).await?;
        let sql = match strategy {
            ExclusionStrategy::ProbePerCandidate => format!(
                r#"
                    SELECT h.id FROM temp.scratch_hashes h
                    WHERE NOT EXISTS (
                        SELECT 1 FROM {table} m
                        WHERE m.file_service_id = ? AND m.tag_service_id = ? AND m.hash_id = h.id AND m.status = ?
                            AND m.tag_id IN (SELECT id FROM temp.scratch_exclusion)
                    )
                "#,
                table = self.layer.table(),
            ),
            ExclusionStrategy::Materialize => format!(
                r#"
                    SELECT id FROM temp.scratch_hashes
                    EXCEPT
                    SELECT m.hash_id
                    FROM temp.scratch_exclusion e CROSS JOIN {table} m
                    WHERE m.file_service_id = ? AND m.tag_service_id = ? AND m.tag_id = e.id AND m.status = ?
                "#,
                table = self.layer.table(),
            ),
        };
        tracing::trace!(?strategy, files = hashes.len(), exclusion_weight, "Exclusion join");
        self.fetch_hashes(conn, &sql).await
    }

    /// Run a query taking (file service, tag service, status) parameters.
    async fn fetch_hashes(&self, conn: &mut SqliteConnection, sql: &str) -> Result<BTreeSet<HashId>> {
        let hashes: Vec<i64> = sqlx::query_scalar(sql)
            .bind(self.scope.file_service.0)
            .bind(self.scope.tag_service.0)
            .bind(self.status.as_db())
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(hashes.into_iter().map(HashId).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::ids::{FileServiceId, TagServiceId};

    const SCOPE: MappingScope = MappingScope { file_service: FileServiceId(0), tag_service: TagServiceId(1) };

    fn h(ids: &[i64]) -> BTreeSet<HashId> {
        ids.iter().copied().map(HashId).collect()
    }

    fn t(ids: &[i64]) -> BTreeSet<TagId> {
        ids.iter().copied().map(TagId).collect()
    }

    async fn seed(conn: &mut SqliteConnection, rows: &[(i64, i64, ContentStatus)]) {
        for (tag, hash, status) in rows {
            sqlx::query(
                "INSERT INTO storage_mappings (file_service_id, tag_service_id, tag_id, hash_id, status) VALUES (0, 1, ?, ?, ?)",
            )
            .bind(tag)
            .bind(hash)
            .bind(status.as_db())
            .execute(&mut *conn)
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn tagged_and_untagged() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        seed(
            &mut conn,
            &[
                (1, 10, ContentStatus::Current),
                (1, 11, ContentStatus::Current),
                (2, 11, ContentStatus::Current),
                (2, 12, ContentStatus::Pending),
                (3, 13, ContentStatus::Deleted),
            ],
        )
        .await;
        let current = MappingFilter::new(Layer::Storage, SCOPE, ContentStatus::Current);
        assert_eq!(current.tagged(&mut conn, &t(&[1, 2])).await.unwrap(), h(&[10, 11]));
        assert_eq!(current.tagged_within(&mut conn, &h(&[11, 12, 13]), &t(&[2, 3])).await.unwrap(), h(&[11]));
        assert_eq!(current.untagged_within(&mut conn, &h(&[10, 11, 12]), &t(&[2])).await.unwrap(), h(&[10, 12]));
        assert_eq!(current.untagged_within(&mut conn, &h(&[10]), &t(&[])).await.unwrap(), h(&[10]));

        let pending = MappingFilter::new(Layer::Storage, SCOPE, ContentStatus::Pending);
        assert_eq!(pending.tagged(&mut conn, &t(&[2])).await.unwrap(), h(&[12]));
    }

    #[tokio::test]
    async fn both_exclusion_strategies_agree() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let rows: Vec<(i64, i64, ContentStatus)> =
            (0..50).map(|hash| (1 + hash % 3, hash, ContentStatus::Current)).collect();
        seed(&mut conn, &rows).await;
        let filter = MappingFilter::new(Layer::Storage, SCOPE, ContentStatus::Current);
        // No count rows were written, so the exclusion weighs nothing and gets
        // materialised; with counts in place a small candidate set probes.
        let candidates = h(&[0, 1, 2, 3, 4, 5]);
        let materialised = filter.untagged_within(&mut conn, &candidates, &t(&[1])).await.unwrap();
        sqlx::query(
            "INSERT INTO tag_counts (display_type, file_service_id, tag_service_id, tag_id, current_count, pending_count) VALUES (0, 0, 1, 1, 17, 0)",
        )
        .execute(&mut *conn)
        .await
        .unwrap();
        let probed = filter.untagged_within(&mut conn, &candidates, &t(&[1])).await.unwrap();
        assert_eq!(materialised, probed);
        assert_eq!(probed, h(&[1, 2, 4, 5]));
    }
}
