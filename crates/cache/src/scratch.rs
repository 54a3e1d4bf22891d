//! Scratch id sets for mid-query joins.
//!
//! Each role owns one temporary table per connection. Tables are created on
//! first use and emptied (not dropped) on every refill, so a busy writer
//! reuses the same handful of tables instead of churning through new ones.
//! Two sets that must be alive at the same time need different roles.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

/// Rows per multi-value INSERT, comfortably under SQLite's bound parameter limit.
pub(crate) const INSERT_BATCH: usize = 400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ScratchRole {
    /// Candidate files.
    Hashes,
    /// Files surviving a membership filter.
    Filter,
    /// The tag set driving a join.
    Tags,
    /// Tags whose presence disqualifies a candidate.
    Exclusion,
    /// Worklist frontier for chain walks.
    Frontier,
    /// Keys of a batched point lookup; filled and read by a single statement.
    Lookup,
}

impl ScratchRole {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Hashes => "temp.scratch_hashes",
            Self::Filter => "temp.scratch_filter",
            Self::Tags => "temp.scratch_tags",
            Self::Exclusion => "temp.scratch_exclusion",
            Self::Frontier => "temp.scratch_frontier",
            Self::Lookup => "temp.scratch_lookup",
        }
    }

    fn create_sql(&self) -> &'static str {
        match self {
            Self::Hashes => "CREATE TEMP TABLE IF NOT EXISTS scratch_hashes (id INTEGER PRIMARY KEY)",
            Self::Filter => "CREATE TEMP TABLE IF NOT EXISTS scratch_filter (id INTEGER PRIMARY KEY)",
            Self::Tags => "CREATE TEMP TABLE IF NOT EXISTS scratch_tags (id INTEGER PRIMARY KEY)",
            Self::Exclusion => "CREATE TEMP TABLE IF NOT EXISTS scratch_exclusion (id INTEGER PRIMARY KEY)",
            Self::Frontier => "CREATE TEMP TABLE IF NOT EXISTS scratch_frontier (id INTEGER PRIMARY KEY)",
            Self::Lookup => "CREATE TEMP TABLE IF NOT EXISTS scratch_lookup (id INTEGER PRIMARY KEY)",
        }
    }

    fn clear_sql(&self) -> &'static str {
        match self {
            Self::Hashes => "DELETE FROM temp.scratch_hashes",
            Self::Filter => "DELETE FROM temp.scratch_filter",
            Self::Tags => "DELETE FROM temp.scratch_tags",
            Self::Exclusion => "DELETE FROM temp.scratch_exclusion",
            Self::Frontier => "DELETE FROM temp.scratch_frontier",
            Self::Lookup => "DELETE FROM temp.scratch_lookup",
        }
    }
}

/// Replace the contents of `role`'s table with `ids`. Returns the number of
/// distinct ids stored.
pub(crate) async fn fill(
    conn: &mut SqliteConnection,
    role: ScratchRole,
    ids: impl IntoIterator<Item = i64>,
) -> Result<usize> {
    sqlx::query(role.create_sql()).execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    sqlx::query(role.clear_sql()).execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    let mut ids: Vec<i64> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    for chunk in ids.chunks(INSERT_BATCH) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!("INSERT INTO {} (id) ", role.table()));
        builder.push_values(chunk, |mut row, id| {
            row.push_bind(*id);
        });
        builder.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    }
    tracing::trace!(role = ?role, len = ids.len(), "Scratch set filled");
    Ok(ids.len())
}

/// Read back the contents of `role`'s table.
pub(crate) async fn read(conn: &mut SqliteConnection, role: ScratchRole) -> Result<Vec<i64>> {
    sqlx::query(role.create_sql()).execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    let sql = format!("SELECT id FROM {} ORDER BY id", role.table());
    sqlx::query_scalar(&sql).fetch_all(&mut *conn).await.or_raise(|| ErrorKind::Database)
}
