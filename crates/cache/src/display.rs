//! What a stored tag shows up as, and what shows a display tag.
//!
//! A storage tag *implies* its ideal plus all of that ideal's ancestors. A
//! display tag is *implied by* every storage tag collapsing onto it or onto
//! one of its descendants. Everything the display caches do is phrased in
//! those two relations.

use crate::error::Result;
use crate::ids::{TagDisplayType, TagId, TagServiceId};
use crate::parents::ParentResolver;
use crate::services::ServiceRegistry;
use crate::siblings::SiblingResolver;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::instrument;

/// How implications moved during a sibling/parent regeneration.
///
/// Keyed by display tag: the storage tags that started (`added`) or stopped
/// (`removed`) implying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImplicationDelta {
    pub added: BTreeMap<TagId, BTreeSet<TagId>>,
    pub removed: BTreeMap<TagId, BTreeSet<TagId>>,
    /// Every tag whose chain membership may have changed.
    pub touched: BTreeSet<TagId>,
}

impl ImplicationDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Display tags with at least one implication added or removed.
    pub fn display_tags(&self) -> BTreeSet<TagId> {
        self.added.keys().chain(self.removed.keys()).copied().collect()
    }

    fn record(&mut self, tag: TagId, old: &BTreeSet<TagId>, new: &BTreeSet<TagId>) {
        for display in new.difference(old) {
            self.added.entry(*display).or_default().insert(tag);
        }
        for display in old.difference(new) {
            self.removed.entry(*display).or_default().insert(tag);
        }
    }
}

/// In-memory copy of (part of) one view's sibling and parent lookups.
#[derive(Debug, Default)]
pub(crate) struct ViewSnapshot {
    ideals: BTreeMap<TagId, TagId>,
    ancestors: BTreeMap<TagId, BTreeSet<TagId>>,
}

impl ViewSnapshot {
    pub(crate) fn implies(&self, tag: TagId) -> BTreeSet<TagId> {
        let ideal = self.ideals.get(&tag).copied().unwrap_or(tag);
        let mut implied = self.ancestors.get(&ideal).cloned().unwrap_or_default();
        implied.insert(ideal);
        implied
    }

    fn tags(&self) -> BTreeSet<TagId> {
        let mut tags = BTreeSet::new();
        for (bad, ideal) in &self.ideals {
            tags.insert(*bad);
            tags.insert(*ideal);
        }
        for (child, ancestors) in &self.ancestors {
            tags.insert(*child);
            tags.extend(ancestors.iter().copied());
        }
        tags
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DisplayCoordinator<'a> {
    siblings: SiblingResolver<'a>,
    parents: ParentResolver<'a>,
}

impl<'a> DisplayCoordinator<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { siblings: SiblingResolver::new(registry), parents: ParentResolver::new(registry) }
    }

    pub fn siblings(&self) -> &SiblingResolver<'a> {
        &self.siblings
    }

    pub fn parents(&self) -> &ParentResolver<'a> {
        &self.parents
    }

    /// The display tags `tag` causes to appear: its ideal and the ideal's
    /// ancestors. Under [`TagDisplayType::Storage`] that's just `tag`.
    pub async fn implies(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tag: TagId,
    ) -> Result<BTreeSet<TagId>> {
        let ideal = self.siblings.ideal(conn, display_type, service, tag).await?;
        let mut implied = match display_type {
            TagDisplayType::Storage => BTreeSet::new(),
            _ => self.parents.ancestors(conn, display_type, service, ideal).await?,
        };
        implied.insert(ideal);
        Ok(implied)
    }

    /// The storage tags whose presence makes `tag` appear. Empty when `tag`
    /// isn't an ideal (it never displays as itself).
    pub async fn implied_by(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tag: TagId,
    ) -> Result<BTreeSet<TagId>> {
        if display_type == TagDisplayType::Storage {
            return Ok(BTreeSet::from([tag]));
        }
        if self.siblings.ideal(conn, display_type, service, tag).await? != tag {
            return Ok(BTreeSet::new());
        }
        let mut ideals = self.parents.descendants(conn, display_type, service, tag).await?;
        ideals.insert(tag);
        self.siblings.chains_members(conn, display_type, service, &ideals).await
    }

    /// Batched [`implies`](Self::implies). Every input tag has an entry.
    pub async fn tags_to_implies(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, BTreeSet<TagId>>> {
        let ideals = self.siblings.ideals(conn, display_type, service, tags).await?;
        let unique: BTreeSet<TagId> = ideals.values().copied().collect();
        let ancestors = self.parents.ancestors_of(conn, display_type, service, &unique).await?;
        Ok(ideals
            .into_iter()
            .map(|(tag, ideal)| {
                let mut implied = ancestors.get(&ideal).cloned().unwrap_or_default();
                implied.insert(ideal);
                (tag, implied)
            })
            .collect())
    }

    /// Batched [`implied_by`](Self::implied_by). Every input tag has an entry.
    pub async fn tags_to_implied_by(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, BTreeSet<TagId>>> {
        let ideals = self.siblings.ideals(conn, display_type, service, tags).await?;
        let roots: BTreeSet<TagId> = ideals.iter().filter(|(tag, ideal)| tag == ideal).map(|(tag, _)| *tag).collect();
        let descendants = self.parents.descendants_by(conn, display_type, service, &roots).await?;
        let mut wanted = roots.clone();
        wanted.extend(descendants.values().flatten().copied());
        let members = self.siblings.members_by_ideal(conn, display_type, service, &wanted).await?;
        Ok(tags
            .iter()
            .map(|tag| {
                let mut implied_by = BTreeSet::new();
                if roots.contains(tag) {
                    let below = descendants.get(tag).into_iter().flatten();
                    for ideal in std::iter::once(tag).chain(below) {
                        implied_by.insert(*ideal);
                        implied_by.extend(members.get(ideal).into_iter().flatten().copied());
                    }
                }
                (*tag, implied_by)
            })
            .collect())
    }

    /// Whether `tag` takes part in any sibling or parent relation.
    pub async fn is_chained(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tag: TagId,
    ) -> Result<bool> {
        Ok(!self.filter_chained(conn, display_type, service, &BTreeSet::from([tag])).await?.is_empty())
    }

    /// The subset of `tags` taking part in any sibling or parent relation.
    pub async fn filter_chained(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeSet<TagId>> {
        let mut chained = self.siblings.chained(conn, display_type, service, tags).await?;
        let rest: BTreeSet<TagId> = tags.difference(&chained).copied().collect();
        chained.extend(self.parents.chained(conn, display_type, service, &rest).await?);
        Ok(chained)
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Load a view's whole sibling and parent lookups.
    pub(crate) async fn snapshot(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<ViewSnapshot> {
        Ok(ViewSnapshot {
            ideals: self.siblings.lookup(conn, display_type, service).await?,
            ancestors: self.parents.lookup(conn, display_type, service).await?,
        })
    }

    /// Rebuild a view's sibling lookup and then its parent closure from
    /// scratch, reporting every implication that moved.
    #[instrument(skip_all, fields(display_type = %display_type, service = %service))]
    pub async fn regen(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
    ) -> Result<ImplicationDelta> {
        let mut delta = ImplicationDelta::default();
        if display_type == TagDisplayType::Storage {
            return Ok(delta);
        }
        let old = self.snapshot(conn, display_type, service).await?;
        self.siblings.regen(conn, display_type, service).await?;
        self.parents.regen(conn, display_type, service).await?;
        let new = self.snapshot(conn, display_type, service).await?;
        let mut touched = old.tags();
        touched.extend(new.tags());
        for tag in &touched {
            delta.record(*tag, &old.implies(*tag), &new.implies(*tag));
        }
        delta.touched = touched;
        Ok(delta)
    }

    /// Incremental [`regen`](Self::regen) around `changed`.
    ///
    /// Sibling chains are regenerated first: parent rows are keyed on ideal
    /// tags, and those may just have moved. The parent closure to regenerate
    /// is grown from every tag of the sibling closure, so it covers both the
    /// old and the new ideals.
    #[instrument(level = "debug", skip_all, fields(display_type = %display_type, service = %service))]
    pub async fn regen_chains(
        &self,
        conn: &mut SqliteConnection,
        display_type: TagDisplayType,
        service: TagServiceId,
        changed: &BTreeSet<TagId>,
    ) -> Result<ImplicationDelta> {
        let mut delta = ImplicationDelta::default();
        if display_type == TagDisplayType::Storage || changed.is_empty() {
            return Ok(delta);
        }
        let sibling_closure = self.siblings.closure(conn, display_type, service, changed).await?;
        let old_ideals = self.siblings.ideals(conn, display_type, service, &sibling_closure).await?;
        self.siblings.rewrite(conn, display_type, service, &sibling_closure).await?;

        let parent_closure = self.parents.closure(conn, display_type, service, &sibling_closure).await?;
        let old_ancestors = self.parents.ancestors_of(conn, display_type, service, &parent_closure).await?;
        self.parents.rewrite(conn, display_type, service, &parent_closure).await?;

        let mut affected = sibling_closure.clone();
        affected.extend(self.siblings.chains_members(conn, display_type, service, &parent_closure).await?);
        let new_ideals = self.siblings.ideals(conn, display_type, service, &affected).await?;
        let unique: BTreeSet<TagId> = new_ideals.values().copied().collect();
        let new = ViewSnapshot {
            ancestors: self.parents.ancestors_of(conn, display_type, service, &unique).await?,
            ideals: new_ideals,
        };
        // Outside the sibling closure no ideal moved.
        let old = ViewSnapshot {
            ideals: affected
                .iter()
                .map(|tag| (*tag, old_ideals.get(tag).or_else(|| new.ideals.get(tag)).copied().unwrap_or(*tag)))
                .collect(),
            ancestors: old_ancestors,
        };
        for tag in &affected {
            delta.record(*tag, &old.implies(*tag), &new.implies(*tag));
        }
        delta.touched = affected;
        delta.touched.extend(parent_closure);
        tracing::debug!(
            affected = delta.touched.len(),
            display_tags = delta.display_tags().len(),
            "Regenerated display chains"
        );
        Ok(delta)
    }
}
