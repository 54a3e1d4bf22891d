//! Parent resolution: the ancestor closure over ideal tags.
//!
//! Raw `child → parent` assertions in `tag_parents` may name any tag. Before
//! they enter a view's closure (`parent_lookup`), both ends are replaced by
//! their ideal in the same view, and edges that collapse onto themselves are
//! dropped. The closure is transitive and irreflexive; one row per
//! (child, ancestor) pair.

use crate::error::{ErrorKind, Result};
use crate::graph::{self, Adjacency, Neighbourhood};
use crate::ids::{ContentStatus, TagDisplayType, TagId, TagServiceId};
use crate::models::{EdgeRow, ParentRow};
use crate::scratch::{self, INSERT_BATCH, ScratchRole};
use crate::services::{Relation, ServiceRegistry};
use crate::siblings::SiblingResolver;
use exn::ResultExt;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use tracing::instrument;

#[derive(Debug, Clone, Copy)]
pub struct ParentResolver<'a> {
    registry: &'a ServiceRegistry,
    siblings: SiblingResolver<'a>,
}

impl<'a> ParentResolver<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry, siblings: SiblingResolver::new(registry) }
    }

    fn sources(&self, display_type: TagDisplayType, service: TagServiceId) -> Vec<TagServiceId> {
        match display_type {
            TagDisplayType::Storage => Vec::new(),
            TagDisplayType::Ideal => vec![service],
            TagDisplayType::Actual => self.registry.applicable(Relation::Parents, service),
        }
    }

    // =========================================================================
    // Raw edges
    // =========================================================================

    async fn applied_edges(conn: &mut SqliteConnection, service: TagServiceId) -> Result<Vec<(TagId, TagId)>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(
            r#"
                SELECT child_tag_id AS from_tag_id, parent_tag_id AS to_tag_id
                FROM tag_parents
                WHERE service_id = ? AND status != ?
                ORDER BY child_tag_id, parent_tag_id
            "#,
        )
        .bind(service.0)
        .bind(ContentStatus::Deleted.as_db())
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(rows.iter().map(EdgeRow::pair).collect())
    }

    /// Assert `child → parent` edges on `service`. Self edges and edges that
    /// would close a cycle among the service's own applied edges are dropped.
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
        for (child, parent) in Self::applied_edges(conn, service).await? {
            existing.insert(child, parent);
        }
        let mut accepted = Vec::with_capacity(pairs.len());
        for (child, parent) in pairs.iter().copied() {
            if graph::closes_cycle(&existing, child, parent) {
                tracing::debug!(%service, %child, %parent, "Rejected parent edge: would close a cycle");
                continue;
            }
            sqlx::query(
                r#"
                    INSERT INTO tag_parents (service_id, child_tag_id, parent_tag_id, status) VALUES (?, ?, ?, ?)
                    ON CONFLICT (service_id, child_tag_id, parent_tag_id) DO UPDATE SET status = excluded.status
                "#,
            )
            .bind(service.0)
            .bind(child.0)
            .bind(parent.0)
            .bind(status.as_db())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            existing.insert(child, parent);
            accepted.push((child, parent));
        }
        Ok(accepted)
    }

    pub async fn remove_edges(
        &self,
        conn: &mut SqliteConnection,
        service: TagServiceId,
        pairs: &[(TagId, TagId)],
    ) -> Result<Vec<(TagId, TagId)>> {
        let mut removed = Vec::new();
        for (child, parent) in pairs.iter().copied() {
            let result = sqlx::query(
                r#"
                    UPDATE tag_parents SET status = ?
                    WHERE service_id = ? AND child_tag_id = ? AND parent_tag_id = ? AND status != ?
                "#,
            )
            .bind(ContentStatus::Deleted.as_db())
            .bind(service.0)
            .bind(child.0)
            .bind(parent.0)
            .bind(ContentStatus::Deleted.as_db())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            if result.rows_affected() > 0 {
                removed.push((child, parent));
            }
        }
        Ok(removed)
    }

    /// Every applied edge feeding a view, in precedence order, idealised
    /// through the view's current sibling lookup.
    async fn view_edges(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<Vec<(TagId, TagId)>> {
        let mut raw = Vec::new();
        for source in self.sources(display_type, service) {
            raw.extend(Self::applied_edges(conn, source).await?);
        }
        let endpoints: BTreeSet<TagId> = raw.iter().flat_map(|(child, parent)| [*child, *parent]).collect();
        let ideals = self.siblings.ideals(conn, display_type, service, &endpoints).await?;
        Ok(raw
            .into_iter()
            .map(|(child, parent)| {
                (ideals.get(&child).copied().unwrap_or(child), ideals.get(&parent).copied().unwrap_or(parent))
            })
            .filter(|(child, parent)| child != parent)
            .collect())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn ancestors(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideal: TagId,
    ) -> Result<BTreeSet<TagId>> {
        let ancestors: Vec<i64> = sqlx::query_scalar(
            "SELECT ancestor_tag_id FROM parent_lookup WHERE display_type = ? AND service_id = ? AND child_tag_id = ?",
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .bind(ideal.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(ancestors.into_iter().map(TagId).collect())
    }

    pub async fn descendants(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideal: TagId,
    ) -> Result<BTreeSet<TagId>> {
        let descendants: Vec<i64> = sqlx::query_scalar(
            "SELECT child_tag_id FROM parent_lookup WHERE display_type = ? AND service_id = ? AND ancestor_tag_id = ?",
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .bind(ideal.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(descendants.into_iter().map(TagId).collect())
    }

    /// Batched [`ancestors`](Self::ancestors). Ideals without ancestors have
    /// no entry.
    pub async fn ancestors_of(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideals: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, BTreeSet<TagId>>> {
        let mut ancestors: BTreeMap<TagId, BTreeSet<TagId>> = BTreeMap::new();
        if display_type == TagDisplayType::Storage || ideals.is_empty() {
            return Ok(ancestors);
        }
        scratch::fill(conn, ScratchRole::Lookup, ideals.iter().map(|tag| tag.0)).await?;
        let rows: Vec<ParentRow> = sqlx::query_as(
            r#"
                SELECT child_tag_id, ancestor_tag_id FROM parent_lookup
                WHERE display_type = ? AND service_id = ? AND child_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        for (child, ancestor) in rows.into_iter().map(<(TagId, TagId)>::from) {
            ancestors.entry(child).or_default().insert(ancestor);
        }
        Ok(ancestors)
    }

    /// Union of the descendants of every given ideal.
    pub async fn descendants_of(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideals: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        if display_type == TagDisplayType::Storage || ideals.is_empty() {
            return Ok(BTreeSet::new());
        }
        scratch::fill(conn, ScratchRole::Lookup, ideals.iter().map(|tag| tag.0)).await?;
        let children: Vec<i64> = sqlx::query_scalar(
            r#"
                SELECT DISTINCT child_tag_id FROM parent_lookup
                WHERE display_type = ? AND service_id = ? AND ancestor_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(children.into_iter().map(TagId).collect())
    }

    /// [`descendants`](Self::descendants) of each given ideal, keyed by that
    /// ideal. Ideals without descendants are left out.
    pub async fn descendants_by(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideals: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, BTreeSet<TagId>>> {
        let mut descendants: BTreeMap<TagId, BTreeSet<TagId>> = BTreeMap::new();
        if display_type == TagDisplayType::Storage || ideals.is_empty() {
            return Ok(descendants);
        }
        scratch::fill(conn, ScratchRole::Lookup, ideals.iter().map(|tag| tag.0)).await?;
        let rows: Vec<ParentRow> = sqlx::query_as(
            r#"
                SELECT child_tag_id, ancestor_tag_id FROM parent_lookup
                WHERE display_type = ? AND service_id = ? AND ancestor_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        for (child, ancestor) in rows.into_iter().map(<(TagId, TagId)>::from) {
            descendants.entry(ancestor).or_default().insert(child);
        }
        Ok(descendants)
    }

    /// Every ideal connected to `ideals` through the closure, in either
    /// direction, `ideals` included.
    ///
    /// Worklist walk: each round only queries the tags first seen in the
    /// previous round, so it ends after at most one round per distinct tag.
    pub async fn chain_members(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideals: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        let mut visited = ideals.clone();
        if display_type == TagDisplayType::Storage {
            return Ok(visited);
        }
        let mut frontier: Vec<TagId> = ideals.iter().copied().collect();
        while !frontier.is_empty() {
            scratch::fill(conn, ScratchRole::Frontier, frontier.iter().map(|tag| tag.0)).await?;
            let rows: Vec<ParentRow> = sqlx::query_as(
                r#"
                    SELECT child_tag_id, ancestor_tag_id FROM parent_lookup
                    WHERE display_type = ?1 AND service_id = ?2
                        AND child_tag_id IN (SELECT id FROM temp.scratch_frontier)
                    UNION
                    SELECT child_tag_id, ancestor_tag_id FROM parent_lookup
                    WHERE display_type = ?1 AND service_id = ?2
                        AND ancestor_tag_id IN (SELECT id FROM temp.scratch_frontier)
                "#,
            )
            .bind(display_type.as_db())
            .bind(service.0)
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            let found: BTreeSet<TagId> = rows
                .into_iter()
                .map(<(TagId, TagId)>::from)
                .flat_map(|(child, ancestor)| [child, ancestor])
                .collect();
            frontier = found.difference(&visited).copied().collect();
            visited.extend(frontier.iter().copied());
        }
        Ok(visited)
    }

    /// The subset of `tags` that appears anywhere in the closure.
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
                SELECT child_tag_id FROM parent_lookup
                WHERE display_type = ?1 AND service_id = ?2 AND child_tag_id IN (SELECT id FROM temp.scratch_lookup)
                UNION
                SELECT ancestor_tag_id FROM parent_lookup
                WHERE display_type = ?1 AND service_id = ?2 AND ancestor_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(chained.into_iter().map(TagId).collect())
    }

    /// The whole closure of a view, `child → ancestors`.
    pub async fn lookup(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<BTreeMap<TagId, BTreeSet<TagId>>> {
        let rows: Vec<ParentRow> = sqlx::query_as(
            "SELECT child_tag_id, ancestor_tag_id FROM parent_lookup WHERE display_type = ? AND service_id = ?",
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        let mut closure: BTreeMap<TagId, BTreeSet<TagId>> = BTreeMap::new();
        for (child, ancestor) in rows.into_iter().map(<(TagId, TagId)>::from) {
            closure.entry(child).or_default().insert(ancestor);
        }
        Ok(closure)
    }

    /// Resolve a view's closure from scratch against the view's current
    /// sibling lookup, without touching the closure table.
    pub(crate) async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<BTreeMap<TagId, BTreeSet<TagId>>> {
        let edges = self.view_edges(conn, display_type, service).await?;
        Ok(graph::parent_closure(edges))
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Rebuild a view's whole closure. The view's sibling lookup must already
    /// be up to date.
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
        let closure = self.resolve(conn, display_type, service).await?;
        sqlx::query("DELETE FROM parent_lookup WHERE display_type = ? AND service_id = ?")
            .bind(display_type.as_db())
            .bind(service.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let rows = Self::insert_lookup(conn, display_type, service, &closure).await?;
        tracing::info!(display_type = %display_type, service = %service, rows, "Regenerated parent lookup");
        Ok(rows)
    }

    /// Connected component of `changed` over the view's idealised edges and
    /// its current closure rows.
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
        for (child, parent) in self.view_edges(conn, display_type, service).await? {
            links.link(child, parent);
        }
        for (child, ancestors) in self.lookup(conn, display_type, service).await? {
            for ancestor in ancestors {
                links.link(child, ancestor);
            }
        }
        Ok(links.component(changed.iter().copied()))
    }

    /// Replace the closure rows of every child in `closure`.
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
        let resolved = graph::parent_closure(edges.into_iter().filter(|(child, _)| closure.contains(child)));
        scratch::fill(conn, ScratchRole::Lookup, closure.iter().map(|tag| tag.0)).await?;
        sqlx::query(
            r#"
                DELETE FROM parent_lookup
                WHERE display_type = ? AND service_id = ? AND child_tag_id IN (SELECT id FROM temp.scratch_lookup)
            "#,
        )
        .bind(display_type.as_db())
        .bind(service.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Self::insert_lookup(conn, display_type, service, &resolved).await?;
        Ok(())
    }

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
        tracing::debug!(closure = closure.len(), "Regenerated parent chains");
        Ok(closure)
    }

    async fn insert_lookup(
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        closure: &BTreeMap<TagId, BTreeSet<TagId>>,
    ) -> Result<usize> {
        let rows: Vec<(TagId, TagId)> = closure
            .iter()
            .flat_map(|(child, ancestors)| ancestors.iter().map(|ancestor| (*child, *ancestor)))
            .collect();
        for chunk in rows.chunks(INSERT_BATCH) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO parent_lookup (display_type, service_id, child_tag_id, ancestor_tag_id) ");
            builder.push_values(chunk, |mut row, (child, ancestor)| {
                row.push_bind(display_type.as_db()).push_bind(service.0).push_bind(child.0).push_bind(ancestor.0);
            });
            builder.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
        }
        Ok(rows.len())
    }
}
