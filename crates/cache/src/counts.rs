//! Tag counts per (display type, file service, tag service).
//!
//! Only [`TagDisplayType::Storage`] and [`TagDisplayType::Actual`] scopes are
//! kept: they count the storage and display mapping caches respectively.
//! A count row always equals the exact number of current/pending mapping rows
//! for its tag in its scope; rows that reach zero/zero are deleted.

use crate::error::{ErrorKind, Result};
use crate::filter::Layer;
use crate::ids::{ContentStatus, FileServiceId, MappingScope, TagDisplayType, TagId, TagServiceId};
use crate::models::CountRow;
use crate::scratch::{self, ScratchRole};
use crate::services::ServiceRegistry;
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A count that may only be known within bounds.
///
/// Counts of one real tag service are always exact. Merging several services
/// can't tell whether two services tag the same file, so the merged value is
/// reported as a range instead of paying for an identity-resolution pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountBounds {
    pub min: u64,
    /// `None` when unbounded.
    pub max: Option<u64>,
}

impl CountBounds {
    pub fn exact(count: u64) -> Self {
        Self { min: count, max: Some(count) }
    }

    pub fn is_exact(&self) -> bool {
        self.max == Some(self.min)
    }

    pub fn is_zero(&self) -> bool {
        self.max == Some(0)
    }

    /// `(min1 + min2, max1 + max2)`, where the max stays unbounded if either
    /// side is.
    pub fn merge(self, other: Self) -> Self {
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
        Self { min: self.min + other.min, max }
    }
}

impl fmt::Display for CountBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{max}"),
            Some(max) => write!(f, "{}-{max}", self.min),
            None => write!(f, "{}+", self.min),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagCounts {
    pub current: CountBounds,
    pub pending: CountBounds,
}

impl TagCounts {
    pub fn exact(current: u64, pending: u64) -> Self {
        Self { current: CountBounds::exact(current), pending: CountBounds::exact(pending) }
    }

    pub fn merge(self, other: Self) -> Self {
        Self { current: self.current.merge(other.current), pending: self.pending.merge(other.pending) }
    }
}

/// One tag's change, split into the parts that only grow and only shrink.
type CountDelta = (TagId, u64, u64);

#[derive(Debug, Clone, Copy)]
pub struct CountsStore<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> CountsStore<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    /// Add to (or create) count rows.
    pub async fn add_counts(
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        scope: MappingScope,
        rows: &[CountDelta],
    ) -> Result<()> {
        for (tag, current, pending) in rows.iter().copied() {
            if current == 0 && pending == 0 {
                continue;
            }
            sqlx::query(
                r#"
                    INSERT INTO tag_counts
                        (display_type, file_service_id, tag_service_id, tag_id, current_count, pending_count)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT (display_type, file_service_id, tag_service_id, tag_id) DO UPDATE SET
                        current_count = current_count + excluded.current_count,
                        pending_count = pending_count + excluded.pending_count
                "#,
            )
            .bind(display_type.as_db())
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(tag.0)
            .bind(i64::try_from(current).or_raise(|| ErrorKind::InvalidData("current count"))?)
            .bind(i64::try_from(pending).or_raise(|| ErrorKind::InvalidData("pending count"))?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }

    /// Subtract from existing count rows, deleting the ones that reach zero.
    ///
    /// Returns the tags whose rows were deleted. Reducing a missing row, or
    /// reducing below zero, means the counts no longer match the mappings.
    pub async fn reduce_counts(
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        scope: MappingScope,
        rows: &[CountDelta],
    ) -> Result<Vec<TagId>> {
        let mut zeroed = Vec::new();
        for (tag, current, pending) in rows.iter().copied() {
            if current == 0 && pending == 0 {
                continue;
            }
            let remaining: Option<(i64, i64)> = sqlx::query_as(
                r#"
                    UPDATE tag_counts SET
                        current_count = current_count - ?,
                        pending_count = pending_count - ?
                    WHERE display_type = ? AND file_service_id = ? AND tag_service_id = ? AND tag_id = ?
                    RETURNING current_count, pending_count
                "#,
            )
            .bind(i64::try_from(current).or_raise(|| ErrorKind::InvalidData("current count"))?)
            .bind(i64::try_from(pending).or_raise(|| ErrorKind::InvalidData("pending count"))?)
            .bind(display_type.as_db())
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(tag.0)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            match remaining {
                None => {
                    tracing::warn!(%scope, %tag, %display_type, "Reduced a missing count row");
                    exn::bail!(ErrorKind::CountUnderflow(scope));
                },
                Some((current, pending)) if current < 0 || pending < 0 => {
                    tracing::warn!(%scope, %tag, %display_type, current, pending, "Count went negative");
                    exn::bail!(ErrorKind::CountUnderflow(scope));
                },
                Some((0, 0)) => {
                    sqlx::query(
                        r#"
                            DELETE FROM tag_counts
                            WHERE display_type = ? AND file_service_id = ? AND tag_service_id = ? AND tag_id = ?
                        "#,
                    )
                    .bind(display_type.as_db())
                    .bind(scope.file_service.0)
                    .bind(scope.tag_service.0)
                    .bind(tag.0)
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                    zeroed.push(tag);
                },
                Some(_) => {},
            }
        }
        Ok(zeroed)
    }

    /// Exact counts of one real scope. Tags without a row are left out.
    pub(crate) async fn exact_counts(
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        scope: MappingScope,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, (u64, u64)>> {
        if tags.is_empty() {
            return Ok(BTreeMap::new());
        }
        scratch::fill(conn, ScratchRole::Lookup, tags.iter().map(|tag| tag.0)).await?;
        let rows: Vec<CountRow> = sqlx::query_as(
            r#"
                SELECT tag_id, current_count, pending_count FROM tag_counts
                WHERE display_type = ? AND file_service_id = ? AND tag_service_id = ?
                    AND tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter()
            .map(|row| <(TagId, u64, u64)>::try_from(row).map(|(tag, current, pending)| (tag, (current, pending))))
            .collect()
    }

    /// Every count row of a scope.
    pub(crate) async fn all_counts(
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        scope: MappingScope,
    ) -> Result<BTreeMap<TagId, (u64, u64)>> {
        let rows: Vec<CountRow> = sqlx::query_as(
            r#"
                SELECT tag_id, current_count, pending_count FROM tag_counts
                WHERE display_type = ? AND file_service_id = ? AND tag_service_id = ?
            "#,
        )
        .bind(display_type.as_db())
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter()
            .map(|row| <(TagId, u64, u64)>::try_from(row).map(|(tag, current, pending)| (tag, (current, pending))))
            .collect()
    }

    /// Counts for `tags`. Exact for a real tag service; under
    /// [`TagServiceId::COMBINED`] every real service's counts are merged into
    /// bounds. Tags with nothing to count are left out.
    pub async fn get_counts(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        file_service: FileServiceId,
        tag_service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, TagCounts>> {
        let services: Vec<TagServiceId> = match tag_service.is_combined() {
            true => self.registry.tag_services().collect(),
            false => vec![tag_service],
        };
        let mut merged: BTreeMap<TagId, TagCounts> = BTreeMap::new();
        for service in services {
            let scope = MappingScope::new(file_service, service);
            for (tag, (current, pending)) in Self::exact_counts(conn, display_type, scope, tags).await? {
                let counts = TagCounts::exact(current, pending);
                merged
                    .entry(tag)
                    .and_modify(|existing| *existing = existing.merge(counts))
                    .or_insert(counts);
            }
        }
        Ok(merged)
    }

    /// Summed `status` count of `tags`, as a row estimate for the planner.
    pub(crate) async fn weight(
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        scope: MappingScope,
        status: ContentStatus,
        tags: &BTreeSet<TagId>,
    ) -> Result<u64> {
        let counts = Self::exact_counts(conn, display_type, scope, tags).await?;
        Ok(counts
            .values()
            .map(|(current, pending)| match status {
                ContentStatus::Current => *current,
                ContentStatus::Pending => *pending,
                ContentStatus::Deleted | ContentStatus::Petitioned => 0,
            })
            .sum())
    }

    /// Rebuild a scope's counts from the mapping table they count.
    pub(crate) async fn recount(conn: &mut SqliteConnection, layer: Layer, scope: MappingScope) -> Result<()> {
        let display_type = layer.display_type();
        sqlx::query("DELETE FROM tag_counts WHERE display_type = ? AND file_service_id = ? AND tag_service_id = ?")
            .bind(display_type.as_db())
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let sql = format!(
            r#"
                INSERT INTO tag_counts
                    (display_type, file_service_id, tag_service_id, tag_id, current_count, pending_count)
                SELECT ?1, file_service_id, tag_service_id, tag_id,
                    SUM(status = ?4), SUM(status = ?5)
                FROM {table}
                WHERE file_service_id = ?2 AND tag_service_id = ?3 AND status IN (?4, ?5)
                GROUP BY tag_id
            "#,
            table = layer.table(),
        );
        sqlx::query(&sql)
            .bind(display_type.as_db())
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .bind(ContentStatus::Current.as_db())
            .bind(ContentStatus::Pending.as_db())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Counts a scope *should* have, straight from its mapping table.
    pub(crate) async fn tally(
        conn: &mut SqliteConnection,
        layer: Layer,
        scope: MappingScope,
    ) -> Result<BTreeMap<TagId, (u64, u64)>> {
        let sql = format!(
            r#"
                SELECT tag_id, SUM(status = ?3) AS current_count, SUM(status = ?4) AS pending_count
                FROM {table}
                WHERE file_service_id = ?1 AND tag_service_id = ?2 AND status IN (?3, ?4)
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
        rows.into_iter()
            .map(|row| <(TagId, u64, u64)>::try_from(row).map(|(tag, current, pending)| (tag, (current, pending))))
            .collect()
    }
}

/// Count changes collected over one transaction.
///
/// Mapping maintenance records deltas as it goes; [`apply`](Self::apply)
/// writes them once at the end, increases before decreases, so no row ever
/// goes transiently negative just because of the order the deltas were found in.
#[derive(Debug, Default)]
pub struct CountChanges {
    deltas: BTreeMap<(TagDisplayType, MappingScope, TagId), (i64, i64)>,
}

/// What [`CountChanges::apply`] touched.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AppliedCounts {
    /// Every (scope, tag) whose counts changed, in any display type.
    pub touched: BTreeSet<(MappingScope, TagId)>,
    /// Count rows deleted for reaching zero.
    pub zeroed: BTreeSet<(TagDisplayType, MappingScope, TagId)>,
}

impl CountChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, display_type: TagDisplayType, scope: MappingScope, tag: TagId, current: i64, pending: i64) {
        if current == 0 && pending == 0 {
            return;
        }
        let entry = self.deltas.entry((display_type, scope, tag)).or_default();
        entry.0 += current;
        entry.1 += pending;
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.values().all(|(current, pending)| *current == 0 && *pending == 0)
    }

    pub async fn apply(self, conn: &mut SqliteConnection) -> Result<AppliedCounts> {
        let mut increases: BTreeMap<(TagDisplayType, MappingScope), Vec<CountDelta>> = BTreeMap::new();
        let mut decreases: BTreeMap<(TagDisplayType, MappingScope), Vec<CountDelta>> = BTreeMap::new();
        let mut applied = AppliedCounts::default();
        for ((display_type, scope, tag), (current, pending)) in self.deltas {
            if current == 0 && pending == 0 {
                continue;
            }
            applied.touched.insert((scope, tag));
            let up = (tag, current.max(0).unsigned_abs(), pending.max(0).unsigned_abs());
            let down = (tag, current.min(0).unsigned_abs(), pending.min(0).unsigned_abs());
            increases.entry((display_type, scope)).or_default().push(up);
            decreases.entry((display_type, scope)).or_default().push(down);
        }
        for ((display_type, scope), rows) in increases {
            CountsStore::add_counts(conn, display_type, scope, &rows).await?;
        }
        for ((display_type, scope), rows) in decreases {
            for tag in CountsStore::reduce_counts(conn, display_type, scope, &rows).await? {
                applied.zeroed.insert((display_type, scope, tag));
            }
        }
        Ok(applied)
    }
}
