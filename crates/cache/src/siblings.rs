//! Sibling resolution: collapsing equivalent tags onto one ideal tag.
//!
//! Raw assertions live in `tag_siblings`; the resolved `bad → ideal` map for
//! each (display type, tag service) view lives in `sibling_lookup`. Only
//! chained tags have lookup rows. A tag without one is its own ideal.
//!
//! The ideal view of a service is built from that service's own edges. The
//! actual view layers the edges of every service in its applicable-services
//! list, in order, with earlier services winning conflicts.

use crate::error::{ErrorKind, Result};
use crate::graph::{self, Adjacency, Neighbourhood};
use crate::ids::{ContentStatus, TagDisplayType, TagId, TagServiceId};
use crate::models::{EdgeRow, SiblingRow};
use crate::scratch::{self, INSERT_BATCH, ScratchRole};
use crate::services::{Relation, ServiceRegistry};
use exn::ResultExt;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use tracing::instrument;

#[derive(Debug, Clone, Copy)]
pub struct SiblingResolver<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> SiblingResolver<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    /// Services whose edges make up a view, in precedence order.
    fn sources(&self, display_type: TagDisplayType, service: TagServiceId) -> Vec<TagServiceId> {
        match display_type {
            TagDisplayType::Storage => Vec::new(),
            TagDisplayType::Ideal => vec![service],
            TagDisplayType::Actual => self.registry.applicable(Relation::Siblings, service),
        }
    }

    // =========================================================================
    // Raw edges
    // =========================================================================

    async fn applied_edges(conn: &mut SqliteConnection, service: TagServiceId) -> Result<Vec<(TagId, TagId)>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(
            r#"
                SELECT bad_tag_id AS from_tag_id, good_tag_id AS to_tag_id
                FROM tag_siblings
                WHERE service_id = ? AND status != ?
                ORDER BY bad_tag_id, good_tag_id
            "#,
        )
        .bind(service.0)
        .bind(ContentStatus::Deleted.as_db())
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(rows.iter().map(EdgeRow::pair).collect())
    }

    /// Assert `bad → good` edges on `service`.
    ///
    /// An edge that is a self edge, or that would close a cycle among the
    /// service's own applied edges, is dropped. Returns the edges that were
    /// written.
    #[instrument(level = "debug", skip_all, fields(service = %service, count = pairs.len()))]
    pub async fn add_edges(
        &self,
        conn: &mut SqliteConnection,
        service: TagServiceId,
        pairs: &[(TagId, TagId)],
        status: ContentStatus,
    ) -> Result<Vec<(TagId, TagId)>> {
        if !status.is_applied() {
            return self.remove_edges(conn, service, pairs).await;
        }
        let mut existing = Adjacency::new();
        for (bad, good) in Self::applied_edges(conn, service).await? {
            existing.insert(bad, good);
        }
        let mut accepted = Vec::with_capacity(pairs.len());
        for (bad, good) in pairs.iter().copied() {
            if graph::closes_cycle(&existing, bad, good) {
                tracing::debug!(%service, %bad, %good, "Rejected sibling edge: would close a cycle");
                continue;
            }
            sqlx::query(
                r#"
                    INSERT INTO tag_siblings (service_id, bad_tag_id, good_tag_id, status) VALUES (?, ?, ?, ?)
                    ON CONFLICT (service_id, bad_tag_id, good_tag_id) DO UPDATE SET status = excluded.status
                "#,
            )
            .bind(service.0)
            .bind(bad.0)
            .bind(good.0)
            .bind(status.as_db())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            existing.insert(bad, good);
            accepted.push((bad, good));
        }
        Ok(accepted)
    }

    /// Mark edges as deleted. Unknown or already-deleted edges are skipped.
    /// Returns the edges that stopped being applied.
    pub async fn remove_edges(
        &self,
        conn: &mut SqliteConnection,
        service: TagServiceId,
        pairs: &[(TagId, TagId)],
    ) -> Result<Vec<(TagId, TagId)>> {
        let mut removed = Vec::new();
        for (bad, good) in pairs.iter().copied() {
            let result = sqlx::query(
                r#"
                    UPDATE tag_siblings SET status = ?
                    WHERE service_id = ? AND bad_tag_id = ? AND good_tag_id = ? AND status != ?
                "#,
            )
            .bind(ContentStatus::Deleted.as_db())
            .bind(service.0)
            .bind(bad.0)
            .bind(good.0)
            .bind(ContentStatus::Deleted.as_db())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            if result.rows_affected() > 0 {
                removed.push((bad, good));
            }
        }
        Ok(removed)
    }

    /// Every applied edge feeding a view, in precedence order.
    async fn view_edges(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<Vec<(TagId, TagId)>> {
        let mut edges = Vec::new();
        for source in self.sources(display_type, service) {
            edges.extend(Self::applied_edges(conn, source).await?);
        }
        Ok(edges)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// The ideal tag `tag` collapses to (itself when unchained).
    pub async fn ideal(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tag: TagId,
    ) -> Result<TagId> {
        if display_type == TagDisplayType::Storage {
            return Ok(tag);
        }
        let ideal: Option<i64> = sqlx::query_scalar(
            "SELECT ideal_tag_id FROM sibling_lookup WHERE display_type = ? AND service_id = ? AND bad_tag_id = ?",
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .bind(tag.0)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(ideal.map(TagId).unwrap_or(tag))
    }

    /// Batched [`ideal`](Self::ideal). Every input tag has an entry.
    pub async fn ideals(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, TagId>> {
        let mut ideals: BTreeMap<TagId, TagId> = tags.iter().map(|tag| (*tag, *tag)).collect();
        if display_type == TagDisplayType::Storage || tags.is_empty() {
            return Ok(ideals);
        }
        scratch::fill(conn, ScratchRole::Lookup, tags.iter().map(|tag| tag.0)).await?;
        let rows: Vec<SiblingRow> = sqlx::query_as(
            r#"
                SELECT bad_tag_id, ideal_tag_id FROM sibling_lookup
                WHERE display_type = ? AND service_id = ? AND bad_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        for (bad, ideal) in rows.into_iter().map(<(TagId, TagId)>::from) {
            ideals.insert(bad, ideal);
        }
        Ok(ideals)
    }

    /// Every tag collapsing to `ideal`, `ideal` included.
    pub async fn chain_members(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideal: TagId,
    ) -> Result<BTreeSet<TagId>> {
        self.chains_members(conn, display_type, service, &BTreeSet::from([ideal])).await
    }

    /// Batched [`chain_members`](Self::chain_members): the union of every
    /// given ideal's chain.
    pub async fn chains_members(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideals: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        let mut members = ideals.clone();
        if display_type == TagDisplayType::Storage || ideals.is_empty() {
            return Ok(members);
        }
        scratch::fill(conn, ScratchRole::Lookup, ideals.iter().map(|tag| tag.0)).await?;
        let bad: Vec<i64> = sqlx::query_scalar(
            r#"
                SELECT bad_tag_id FROM sibling_lookup
                WHERE display_type = ? AND service_id = ? AND ideal_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        members.extend(bad.into_iter().map(TagId));
        Ok(members)
    }

    /// The bad tags collapsing onto each given ideal. Ideals heading no
    /// chain are left out.
    pub async fn members_by_ideal(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideals: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, BTreeSet<TagId>>> {
        let mut members: BTreeMap<TagId, BTreeSet<TagId>> = BTreeMap::new();
        if display_type == TagDisplayType::Storage || ideals.is_empty() {
            return Ok(members);
        }
        scratch::fill(conn, ScratchRole::Lookup, ideals.iter().map(|tag| tag.0)).await?;
        let rows: Vec<SiblingRow> = sqlx::query_as(
            r#"
                SELECT bad_tag_id, ideal_tag_id FROM sibling_lookup
                WHERE display_type = ? AND service_id = ? AND ideal_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        for (bad, ideal) in rows.into_iter().map(<(TagId, TagId)>::from) {
            members.entry(ideal).or_default().insert(bad);
        }
        Ok(members)
    }

    /// The subset of `tags` that belongs to a non-trivial sibling chain.
    pub async fn chained(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        if display_type == TagDisplayType::Storage || tags.is_empty() {
            return Ok(BTreeSet::new());
        }
        scratch::fill(conn, ScratchRole::Lookup, tags.iter().map(|tag| tag.0)).await?;
        let chained: Vec<i64> = sqlx::query_scalar(
            r#"
                SELECT bad_tag_id FROM sibling_lookup
                WHERE display_type = ?1 AND service_id = ?2 AND bad_tag_id IN (SELECT id FROM temp.scratch_lookup)
                UNION
                SELECT ideal_tag_id FROM sibling_lookup
                WHERE display_type = ?1 AND service_id = ?2 AND ideal_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(chained.into_iter().map(TagId).collect())
    }

    /// The whole resolved map of a view.
    pub async fn lookup(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<BTreeMap<TagId, TagId>> {
        let rows: Vec<SiblingRow> = sqlx::query_as(
            "SELECT bad_tag_id, ideal_tag_id FROM sibling_lookup WHERE display_type = ? AND service_id = ?",
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(<(TagId, TagId)>::from).collect())
    }

    /// Resolve a view from scratch, without touching the lookup table.
    pub(crate) async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<BTreeMap<TagId, TagId>> {
        let edges = self.view_edges(conn, display_type, service).await?;
        Ok(graph::collapse_siblings(edges))
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Rebuild a view's whole lookup from the raw edges.
    #[instrument(skip_all, fields(display_type = %display_type, service = %service))]
    pub async fn regen(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<usize> {
        if display_type == TagDisplayType::Storage {
            return Ok(0);
        }
        let resolved = self.resolve(conn, display_type, service).await?;
        sqlx::query("DELETE FROM sibling_lookup WHERE display_type = ? AND service_id = ?")
            .bind(display_type.as_db())
            .bind(service.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Self::insert_lookup(conn, display_type, service, &resolved).await?;
        tracing::info!(display_type = %display_type, service = %service, rows = resolved.len(), "Regenerated sibling lookup");
        Ok(resolved.len())
    }

    /// Everything a change to `changed` can reach: the connected component
    /// over the view's applied edges and its current lookup rows.
    pub async fn closure(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        changed: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        if display_type == TagDisplayType::Storage {
            return Ok(changed.clone());
        }
        let mut links = Neighbourhood::new();
        for (bad, good) in self.view_edges(conn, display_type, service).await? {
            links.link(bad, good);
        }
        for (bad, ideal) in self.lookup(conn, display_type, service).await? {
            links.link(bad, ideal);
        }
        Ok(links.component(changed.iter().copied()))
    }

    /// Replace the lookup rows of every tag in `closure` with freshly resolved
    /// ones. `closure` must be closed under [`closure`](Self::closure).
    pub(crate) async fn rewrite(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        closure: &BTreeSet<TagId>,
    ) -> Result<()> {
        if display_type == TagDisplayType::Storage || closure.is_empty() {
            return Ok(());
        }
        let edges = self.view_edges(conn, display_type, service).await?;
        let resolved = graph::collapse_siblings(edges.into_iter().filter(|(bad, _)| closure.contains(bad)));
        scratch::fill(conn, ScratchRole::Lookup, closure.iter().map(|tag| tag.0)).await?;
        sqlx::query(
            r#"
                DELETE FROM sibling_lookup
                WHERE display_type = ? AND service_id = ? AND bad_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Self::insert_lookup(conn, display_type, service, &resolved).await
    }

    /// Incremental [`regen`](Self::regen) limited to the chains `changed`
    /// touches, before or after the change. Returns that closure.
    #[instrument(level = "debug", skip_all, fields(display_type = %display_type, service = %service))]
    pub async fn regen_chains(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        changed: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        let closure = self.closure(conn, display_type, service, changed).await?;
        self.rewrite(conn, display_type, service, &closure).await?;
        tracing::debug!(closure = closure.len(), "Regenerated sibling chains");
        Ok(closure)
    }

    async fn insert_lookup(
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        resolved: &BTreeMap<TagId, TagId>,
    ) -> Result<()> {
        let rows: Vec<(TagId, TagId)> = resolved.iter().map(|(bad, ideal)| (*bad, *ideal)).collect();
        for chunk in rows.chunks(INSERT_BATCH) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO sibling_lookup (display_type, service_id, bad_tag_id, ideal_tag_id) ");
            builder.push_values(chunk, |mut row, (bad, ideal)| {
                row.push_bind(display_type.as_db()).push_bind(service.0).push_bind(bad.0).push_bind(ideal.0);
            });
            builder.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    const OWN: TagServiceId = TagServiceId(1);
    const OTHER: TagServiceId = TagServiceId(2);

    fn t(id: i64) -> TagId {
        TagId(id)
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new()
            .with_tag_service(OWN)
            .unwrap()
            .with_tag_service(OTHER)
            .unwrap()
            .with_applicable(Relation::Siblings, OWN, [OWN, OTHER])
            .unwrap()
    }

    #[tokio::test]
    async fn cycle_closing_edges_are_rejected() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let siblings = SiblingResolver::new(&registry);
        let mut conn = db.pool().acquire().await.unwrap();
        let accepted = siblings
            .add_edges(&mut conn, OWN, &[(t(1), t(2)), (t(2), t(3)), (t(3), t(1)), (t(4), t(4))], ContentStatus::Current)
            .await
            .unwrap();
        assert_eq!(accepted, vec![(t(1), t(2)), (t(2), t(3))]);
    }

    #[tokio::test]
    async fn regen_collapses_to_one_hop() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let siblings = SiblingResolver::new(&registry);
        let mut conn = db.pool().acquire().await.unwrap();
        siblings.add_edges(&mut conn, OWN, &[(t(1), t(2)), (t(2), t(3))], ContentStatus::Current).await.unwrap();
        siblings.regen(&mut conn, TagDisplayType::Ideal, OWN).await.unwrap();
        assert_eq!(siblings.ideal(&mut conn, TagDisplayType::Ideal, OWN, t(1)).await.unwrap(), t(3));
        assert_eq!(siblings.ideal(&mut conn, TagDisplayType::Ideal, OWN, t(9)).await.unwrap(), t(9));
        assert_eq!(siblings.ideal(&mut conn, TagDisplayType::Storage, OWN, t(1)).await.unwrap(), t(1));
        let members = siblings.chain_members(&mut conn, TagDisplayType::Ideal, OWN, t(3)).await.unwrap();
        assert_eq!(members, BTreeSet::from([t(1), t(2), t(3)]));
    }

    #[tokio::test]
    async fn actual_view_prefers_earlier_services() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let siblings = SiblingResolver::new(&registry);
        let mut conn = db.pool().acquire().await.unwrap();
        siblings.add_edges(&mut conn, OTHER, &[(t(1), t(5)), (t(2), t(6))], ContentStatus::Current).await.unwrap();
        siblings.add_edges(&mut conn, OWN, &[(t(1), t(4))], ContentStatus::Pending).await.unwrap();
        siblings.regen(&mut conn, TagDisplayType::Actual, OWN).await.unwrap();
        let ideals = siblings
            .ideals(&mut conn, TagDisplayType::Actual, OWN, &BTreeSet::from([t(1), t(2), t(3)]))
            .await
            .unwrap();
        assert_eq!(ideals[&t(1)], t(4));
        assert_eq!(ideals[&t(2)], t(6));
        assert_eq!(ideals[&t(3)], t(3));
        // The ideal view only sees the service's own edges.
        siblings.regen(&mut conn, TagDisplayType::Ideal, OWN).await.unwrap();
        assert_eq!(siblings.ideal(&mut conn, TagDisplayType::Ideal, OWN, t(2)).await.unwrap(), t(2));
    }

    #[tokio::test]
    async fn removed_edges_stop_applying() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let siblings = SiblingResolver::new(&registry);
        let mut conn = db.pool().acquire().await.unwrap();
        siblings.add_edges(&mut conn, OWN, &[(t(1), t(2)), (t(2), t(3))], ContentStatus::Current).await.unwrap();
        siblings.regen(&mut conn, TagDisplayType::Ideal, OWN).await.unwrap();
        let removed = siblings.remove_edges(&mut conn, OWN, &[(t(2), t(3)), (t(7), t(8))]).await.unwrap();
        assert_eq!(removed, vec![(t(2), t(3))]);
        siblings.regen_chains(&mut conn, TagDisplayType::Ideal, OWN, &BTreeSet::from([t(2), t(3)])).await.unwrap();
        assert_eq!(siblings.ideal(&mut conn, TagDisplayType::Ideal, OWN, t(1)).await.unwrap(), t(2));
        assert_eq!(siblings.ideal(&mut conn, TagDisplayType::Ideal, OWN, t(2)).await.unwrap(), t(2));
        assert!(siblings.chained(&mut conn, TagDisplayType::Ideal, OWN, &BTreeSet::from([t(3)])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn regen_chains_matches_full_regen() {
        let db = Database::connect_in_memory().await.unwrap();
        let registry = registry();
        let siblings = SiblingResolver::new(&registry);
        let mut conn = db.pool().acquire().await.unwrap();
        siblings
            .add_edges(&mut conn, OWN, &[(t(1), t(2)), (t(3), t(4)), (t(10), t(11))], ContentStatus::Current)
            .await
            .unwrap();
        siblings.add_edges(&mut conn, OTHER, &[(t(2), t(3)), (t(5), t(1))], ContentStatus::Current).await.unwrap();
        siblings.regen(&mut conn, TagDisplayType::Actual, OWN).await.unwrap();

        siblings.add_edges(&mut conn, OTHER, &[(t(4), t(10))], ContentStatus::Current).await.unwrap();
        siblings.remove_edges(&mut conn, OWN, &[(t(1), t(2))]).await.unwrap();
        let touched = BTreeSet::from([t(1), t(2), t(4), t(10)]);
        siblings.regen_chains(&mut conn, TagDisplayType::Actual, OWN, &touched).await.unwrap();
        let incremental = siblings.lookup(&mut conn, TagDisplayType::Actual, OWN).await.unwrap();

        siblings.regen(&mut conn, TagDisplayType::Actual, OWN).await.unwrap();
        let full = siblings.lookup(&mut conn, TagDisplayType::Actual, OWN).await.unwrap();
        assert_eq!(incremental, full);
        assert_eq!(full[&t(3)], t(11));
        assert!(!full.contains_key(&t(1)));
    }
}
