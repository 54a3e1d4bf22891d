//! Autocomplete: which tags are worth suggesting, and what to say about them.
//!
//! A tag is searchable in a scope while it has something to count there or
//! while it takes part in a sibling or parent chain (so that typing a bad
//! sibling still finds its ideal). The index is kept in step with every
//! count and chain change by [`SearchIndex::sync`].

use crate::counts::{CountsStore, TagCounts};
use crate::definitions::TagDefinitions;
use crate::display::DisplayCoordinator;
use crate::error::{ErrorKind, Result};
use crate::ids::{FileServiceId, MappingScope, TagDisplayType, TagId, TagServiceId};
use crate::scratch::{self, ScratchRole};
use crate::services::ServiceRegistry;
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::instrument;

/// A tag, annotated for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSuggestion {
    pub tag: TagId,
    pub text: Option<String>,
    pub counts: TagCounts,
    /// The tag this one displays as, when that isn't itself.
    pub ideal: Option<TagId>,
    /// The rest of the tag's sibling chain.
    pub siblings: BTreeSet<TagId>,
    /// Ancestors of the tag's ideal.
    pub parents: BTreeSet<TagId>,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchIndex<'a> {
    registry: &'a ServiceRegistry,
    coordinator: DisplayCoordinator<'a>,
    counts: CountsStore<'a>,
}

impl<'a> SearchIndex<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry, coordinator: DisplayCoordinator::new(registry), counts: CountsStore::new(registry) }
    }

    /// Re-evaluate whether each of `tags` belongs in `scope`'s index.
    pub async fn sync(&self, conn: &mut SqliteConnection, scope: MappingScope, tags: &BTreeSet<TagId>) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut keep = BTreeSet::new();
        for display_type in [TagDisplayType::Storage, TagDisplayType::Actual] {
            keep.extend(CountsStore::exact_counts(conn, display_type, scope, tags).await?.into_keys());
        }
        let rest: BTreeSet<TagId> = tags.difference(&keep).copied().collect();
        keep.extend(self.coordinator.filter_chained(conn, TagDisplayType::Actual, scope.tag_service, &rest).await?);
        let drop: BTreeSet<TagId> = tags.difference(&keep).copied().collect();
        Self::insert(conn, scope, &keep).await?;
        if !drop.is_empty() {
            scratch::fill(conn, ScratchRole::Lookup, drop.iter().map(|tag| tag.0)).await?;
            sqlx::query(
                r#"
                    DELETE FROM searchable_tags
                    WHERE file_service_id = ? AND tag_service_id = ? AND tag_id IN (SELECT id FROM temp.scratch_lookup)
                "#,
            )
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        }
        tracing::trace!(scope = %scope, kept = keep.len(), dropped = drop.len(), "Synced searchable tags");
        Ok(())
    }

    /// Rebuild `scope`'s index from its counts and its service's chains.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn rebuild(&self, conn: &mut SqliteConnection, scope: MappingScope) -> Result<usize> {
        sqlx::query("DELETE FROM searchable_tags WHERE file_service_id = ? AND tag_service_id = ?")
            .bind(scope.file_service.0)
            .bind(scope.tag_service.0)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let mut tags = BTreeSet::new();
        for display_type in [TagDisplayType::Storage, TagDisplayType::Actual] {
            tags.extend(CountsStore::all_counts(conn, display_type, scope).await?.into_keys());
        }
        for (bad, ideal) in self.coordinator.siblings().lookup(conn, TagDisplayType::Actual, scope.tag_service).await? {
            tags.insert(bad);
            tags.insert(ideal);
        }
        for (child, ancestors) in
            self.coordinator.parents().lookup(conn, TagDisplayType::Actual, scope.tag_service).await?
        {
            tags.insert(child);
            tags.extend(ancestors);
        }
        Self::insert(conn, scope, &tags).await?;
        Ok(tags.len())
    }

    async fn insert(conn: &mut SqliteConnection, scope: MappingScope, tags: &BTreeSet<TagId>) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        scratch::fill(conn, ScratchRole::Lookup, tags.iter().map(|tag| tag.0)).await?;
        sqlx::query(
            r#"
                INSERT OR IGNORE INTO searchable_tags (file_service_id, tag_service_id, tag_id)
                SELECT ?, ?, id FROM temp.scratch_lookup
            "#,
        )
        .bind(scope.file_service.0)
        .bind(scope.tag_service.0)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// The subset of `candidates` in the index. Under the combined tag
    /// service a tag is searchable if any real service has it.
    pub async fn searchable(
        &self,
        conn: &mut SqliteConnection,
        file_service: FileServiceId,
        tag_service: TagServiceId,
        candidates: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }
        scratch::fill(conn, ScratchRole::Lookup, candidates.iter().map(|tag| tag.0)).await?;
        let tags: Vec<i64> = match tag_service.is_combined() {
            true => sqlx::query_scalar::<_, i64>(
                r#"
                    SELECT DISTINCT tag_id FROM searchable_tags
                    WHERE file_service_id = ? AND tag_id IN (SELECT id FROM temp.scratch_lookup)
                "#,
            )
            .bind(file_service.0)
            .fetch_all(&mut *conn)
            .await,
            false => sqlx::query_scalar::<_, i64>(
                r#"
                    SELECT tag_id FROM searchable_tags
                    WHERE file_service_id = ? AND tag_service_id = ? AND tag_id IN (SELECT id FROM temp.scratch_lookup)
                "#,
            )
            .bind(file_service.0)
            .bind(tag_service.0)
            .fetch_all(&mut *conn)
            .await,
        }
        .or_raise(|| ErrorKind::Database)?;
        Ok(tags.into_iter().map(TagId).collect())
    }

    /// Annotate `tags` with counts and chain metadata.
    ///
    /// Chain metadata comes from the tag service's actual view; the combined
    /// tag service has no single view, so its suggestions carry counts only.
    pub async fn annotate(
        &self,
        conn: &mut SqliteConnection,
        definitions: &dyn TagDefinitions,
        display_type: TagDisplayType,
        file_service: FileServiceId,
        tag_service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<Vec<TagSuggestion>> {
        let counts = self.counts.get_counts(conn, display_type, file_service, tag_service, tags).await?;
        let mut ideals = BTreeMap::new();
        let mut ancestors = BTreeMap::new();
        if !tag_service.is_combined() && self.registry.has_tag_service(tag_service) {
            let siblings = self.coordinator.siblings();
            ideals = siblings.ideals(conn, TagDisplayType::Actual, tag_service, tags).await?;
            let unique: BTreeSet<TagId> = ideals.values().copied().collect();
            ancestors =
                self.coordinator.parents().ancestors_of(conn, TagDisplayType::Actual, tag_service, &unique).await?;
        }
        let mut suggestions = Vec::with_capacity(tags.len());
        for tag in tags.iter().copied() {
            let ideal = ideals.get(&tag).copied().unwrap_or(tag);
            let mut siblings = BTreeSet::new();
            if !ideals.is_empty() {
                let siblings_of = self.coordinator.siblings();
                siblings = siblings_of.chain_members(conn, TagDisplayType::Actual, tag_service, ideal).await?;
                siblings.remove(&tag);
            }
            suggestions.push(TagSuggestion {
                tag,
                text: definitions.text(tag),
                counts: counts.get(&tag).copied().unwrap_or_default(),
                ideal: (ideal != tag).then_some(ideal),
                siblings,
                parents: ancestors.get(&ideal).cloned().unwrap_or_default(),
            });
        }
        Ok(suggestions)
    }

    /// Suggestions for tags whose text starts with `prefix`, most displayed
    /// first.
    #[instrument(level = "debug", skip_all, fields(prefix = prefix, limit = limit))]
    pub async fn search(
        &self,
        conn: &mut SqliteConnection,
        definitions: &dyn TagDefinitions,
        file_service: FileServiceId,
        tag_service: TagServiceId,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<TagSuggestion>> {
        let candidates: BTreeSet<TagId> = definitions.matching(prefix).into_iter().collect();
        let found = self.searchable(conn, file_service, tag_service, &candidates).await?;
        let mut suggestions =
            self.annotate(conn, definitions, TagDisplayType::Actual, file_service, tag_service, &found).await?;
        suggestions.sort_by(|a, b| b.counts.current.min.cmp(&a.counts.current.min).then_with(|| a.text.cmp(&b.text)));
        suggestions.truncate(limit);
        Ok(suggestions)
    }
}
