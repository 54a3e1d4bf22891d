//! Bookkeeping: which derived scopes exist, which are quarantined, and which
//! chain tags are still waiting for a checkpointed regeneration.

use crate::error::{ErrorKind, Result};
use crate::ids::{FileServiceId, MappingScope, TagId, TagServiceId};
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use time::OffsetDateTime;

/// What a `generated_scopes` row records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    Storage,
    Display,
    /// A tag service's sibling/parent lookups; recorded under the combined
    /// file service.
    Lookups,
}

impl ScopeKind {
    fn as_db(&self) -> i64 {
        match self {
            Self::Storage => 0,
            Self::Display => 1,
            Self::Lookups => 2,
        }
    }
}

const READY: i64 = 0;
const QUARANTINED: i64 = 1;

pub(crate) async fn is_generated(conn: &mut SqliteConnection, kind: ScopeKind, scope: MappingScope) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        r#"
            SELECT state FROM generated_scopes
            WHERE kind = ? AND file_service_id = ? AND tag_service_id = ?
        "#,
    )
    .bind(kind.as_db())
    .bind(scope.file_service.0)
    .bind(scope.tag_service.0)
    .fetch_optional(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(found == Some(READY))
}

/// Record a scope as freshly generated, lifting any quarantine.
pub(crate) async fn mark_generated(conn: &mut SqliteConnection, kind: ScopeKind, scope: MappingScope) -> Result<()> {
    sqlx::query(
        r#"
            INSERT INTO generated_scopes (kind, file_service_id, tag_service_id, state, generated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (kind, file_service_id, tag_service_id) DO UPDATE SET
                state = excluded.state,
                generated_at = excluded.generated_at
        "#,
    )
    .bind(kind.as_db())
    .bind(scope.file_service.0)
    .bind(scope.tag_service.0)
    .bind(READY)
    .bind(OffsetDateTime::now_utc().unix_timestamp())
    .execute(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Refuse further incremental changes to `scope` until it's regenerated.
pub(crate) async fn quarantine(conn: &mut SqliteConnection, scope: MappingScope) -> Result<()> {
    tracing::warn!(scope = %scope, "Quarantining inconsistent cache scope");
    for kind in [ScopeKind::Storage, ScopeKind::Display] {
        sqlx::query(
            r#"
                INSERT INTO generated_scopes (kind, file_service_id, tag_service_id, state, generated_at)
                VALUES (?, ?, ?, ?, 0)
                ON CONFLICT (kind, file_service_id, tag_service_id) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(kind.as_db())
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .bind(QUARANTINED)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    }
    Ok(())
}

/// Mark a service's lookups for regeneration. Its scopes are quarantined
/// separately.
pub(crate) async fn quarantine_lookups(conn: &mut SqliteConnection, service: TagServiceId) -> Result<()> {
    tracing::warn!(service = %service, "Quarantining inconsistent lookups");
    sqlx::query("UPDATE generated_scopes SET state = ? WHERE kind = ? AND file_service_id = 0 AND tag_service_id = ?")
        .bind(QUARANTINED)
        .bind(ScopeKind::Lookups.as_db())
        .bind(service.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Fail with [`ErrorKind::Consistency`] if any of `scopes` is quarantined.
pub(crate) async fn ensure_usable(conn: &mut SqliteConnection, scopes: &[MappingScope]) -> Result<()> {
    for scope in scopes {
        let quarantined: Option<i64> = sqlx::query_scalar(
            r#"
                SELECT 1 FROM generated_scopes
                WHERE file_service_id = ? AND tag_service_id = ? AND state = ?
                LIMIT 1
            "#,
        )
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .bind(QUARANTINED)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        if quarantined.is_some() {
            exn::bail!(ErrorKind::Consistency(*scope));
        }
    }
    Ok(())
}

pub(crate) async fn quarantined(conn: &mut SqliteConnection) -> Result<BTreeSet<MappingScope>> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT DISTINCT file_service_id, tag_service_id FROM generated_scopes WHERE state = ?",
    )
    .bind(QUARANTINED)
    .fetch_all(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(rows.into_iter().map(|(fs, ts)| MappingScope::new(FileServiceId(fs), TagServiceId(ts))).collect())
}

// =========================================================================
// Sync queue
// =========================================================================

/// Queue chain tags for a checkpointed regeneration of `service`.
pub(crate) async fn enqueue(conn: &mut SqliteConnection, service: TagServiceId, tags: &BTreeSet<TagId>) -> Result<()> {
    for tag in tags {
        sqlx::query("INSERT OR IGNORE INTO display_sync_queue (tag_service_id, tag_id) VALUES (?, ?)")
            .bind(service.0)
            .bind(tag.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
    }
    Ok(())
}

/// Up to `limit` queued tags of `service`, lowest ids first.
pub(crate) async fn peek(conn: &mut SqliteConnection, service: TagServiceId, limit: usize) -> Result<BTreeSet<TagId>> {
    let tags: Vec<i64> = sqlx::query_scalar(
        "SELECT tag_id FROM display_sync_queue WHERE tag_service_id = ? ORDER BY tag_id LIMIT ?",
    )
    .bind(service.0)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(tags.into_iter().map(TagId).collect())
}

pub(crate) async fn dequeue(conn: &mut SqliteConnection, service: TagServiceId, tags: &BTreeSet<TagId>) -> Result<()> {
    for tag in tags {
        sqlx::query("DELETE FROM display_sync_queue WHERE tag_service_id = ? AND tag_id = ?")
            .bind(service.0)
            .bind(tag.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
    }
    Ok(())
}

pub(crate) async fn queued(conn: &mut SqliteConnection, service: TagServiceId) -> Result<u64> {
    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM display_sync_queue WHERE tag_service_id = ?")
        .bind(service.0)
        .fetch_one(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(queued.max(0).unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    const SCOPE: MappingScope = MappingScope { file_service: FileServiceId(1), tag_service: TagServiceId(2) };

    #[tokio::test]
    async fn quarantine_blocks_until_regenerated() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        assert!(!is_generated(&mut conn, ScopeKind::Storage, SCOPE).await.unwrap());
        mark_generated(&mut conn, ScopeKind::Storage, SCOPE).await.unwrap();
        assert!(is_generated(&mut conn, ScopeKind::Storage, SCOPE).await.unwrap());
        ensure_usable(&mut conn, &[SCOPE]).await.unwrap();

        quarantine(&mut conn, SCOPE).await.unwrap();
        let err = ensure_usable(&mut conn, &[SCOPE]).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Consistency(SCOPE));
        assert_eq!(quarantined(&mut conn).await.unwrap(), BTreeSet::from([SCOPE]));

        mark_generated(&mut conn, ScopeKind::Storage, SCOPE).await.unwrap();
        mark_generated(&mut conn, ScopeKind::Display, SCOPE).await.unwrap();
        ensure_usable(&mut conn, &[SCOPE]).await.unwrap();
    }

    #[tokio::test]
    async fn queue_is_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let service = TagServiceId(1);
        enqueue(&mut conn, service, &BTreeSet::from([TagId(3), TagId(1), TagId(2)])).await.unwrap();
        enqueue(&mut conn, service, &BTreeSet::from([TagId(1)])).await.unwrap();
        assert_eq!(queued(&mut conn, service).await.unwrap(), 3);
        let chunk = peek(&mut conn, service, 2).await.unwrap();
        assert_eq!(chunk, BTreeSet::from([TagId(1), TagId(2)]));
        dequeue(&mut conn, service, &chunk).await.unwrap();
        assert_eq!(peek(&mut conn, service, 10).await.unwrap(), BTreeSet::from([TagId(3)]));
    }
}
