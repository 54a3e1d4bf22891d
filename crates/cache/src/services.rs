//! Read-only registry of the file and tag domains the cache knows about.
//!
//! Built once (usually by `tagmap-config`) and shared behind an `Arc`. The
//! interesting part is the per-service "applicable services" lists: the
//! ordered precedence in which other services' sibling and parent edges are
//! layered onto a service's display. Earlier services win conflicts.

use crate::error::{ErrorKind, Result};
use crate::ids::{FileServiceId, MappingScope, TagServiceId};
use std::collections::{BTreeMap, BTreeSet};

/// Which kind of edge an applicable-services list is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    Siblings,
    Parents,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    file_services: BTreeSet<FileServiceId>,
    tag_services: BTreeSet<TagServiceId>,
    sibling_applicable: BTreeMap<TagServiceId, Vec<TagServiceId>>,
    parent_applicable: BTreeMap<TagServiceId, Vec<TagServiceId>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a real file domain.
    pub fn with_file_service(mut self, id: FileServiceId) -> Result<Self> {
        if id.is_combined() || id.0 < 0 {
            exn::bail!(ErrorKind::CombinedService);
        }
        self.file_services.insert(id);
        Ok(self)
    }

    /// Register a real tag domain. By default it only applies its own edges.
    pub fn with_tag_service(mut self, id: TagServiceId) -> Result<Self> {
        if id.is_combined() || id.0 < 0 {
            exn::bail!(ErrorKind::CombinedService);
        }
        self.tag_services.insert(id);
        Ok(self)
    }

    /// Set the ordered list of services whose edges of `relation` apply to
    /// `service`'s display. Duplicates are dropped, keeping the first position.
    pub fn with_applicable(
        mut self,
        relation: Relation,
        service: TagServiceId,
        applicable: impl IntoIterator<Item = TagServiceId>,
    ) -> Result<Self> {
        self.require_tag_service(service)?;
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for source in applicable {
            self.require_tag_service(source)?;
            if seen.insert(source) {
                ordered.push(source);
            }
        }
        match relation {
            Relation::Siblings => self.sibling_applicable.insert(service, ordered),
            Relation::Parents => self.parent_applicable.insert(service, ordered),
        };
        Ok(self)
    }

    pub fn file_services(&self) -> impl Iterator<Item = FileServiceId> + '_ {
        self.file_services.iter().copied()
    }

    pub fn tag_services(&self) -> impl Iterator<Item = TagServiceId> + '_ {
        self.tag_services.iter().copied()
    }

    /// Every file scope a tag service keeps caches for: the combined scope
    /// first, then each real file domain.
    pub fn file_scopes(&self) -> impl Iterator<Item = FileServiceId> + '_ {
        std::iter::once(FileServiceId::COMBINED).chain(self.file_services())
    }

    /// Every mapping cache scope for one tag service.
    pub fn scopes_for(&self, tag_service: TagServiceId) -> Vec<MappingScope> {
        self.file_scopes().map(|file_service| MappingScope::new(file_service, tag_service)).collect()
    }

    /// Every mapping cache scope across all tag services.
    pub fn all_scopes(&self) -> Vec<MappingScope> {
        self.tag_services().flat_map(|tag_service| self.scopes_for(tag_service)).collect()
    }

    pub fn has_tag_service(&self, id: TagServiceId) -> bool {
        self.tag_services.contains(&id)
    }

    pub fn has_file_service(&self, id: FileServiceId) -> bool {
        id.is_combined() || self.file_services.contains(&id)
    }

    pub fn require_tag_service(&self, id: TagServiceId) -> Result<()> {
        if id.is_combined() {
            exn::bail!(ErrorKind::CombinedService);
        }
        if !self.has_tag_service(id) {
            exn::bail!(ErrorKind::TagServiceNotFound(id));
        }
        Ok(())
    }

    pub fn require_file_service(&self, id: FileServiceId) -> Result<()> {
        if !self.has_file_service(id) {
            exn::bail!(ErrorKind::FileServiceNotFound(id));
        }
        Ok(())
    }

    /// Ordered services whose `relation` edges make up `service`'s actual view.
    pub fn applicable(&self, relation: Relation, service: TagServiceId) -> Vec<TagServiceId> {
        let lists = match relation {
            Relation::Siblings => &self.sibling_applicable,
            Relation::Parents => &self.parent_applicable,
        };
        lists.get(&service).cloned().unwrap_or_else(|| vec![service])
    }

    /// Services whose actual view depends on `relation` edges asserted on `source`.
    pub fn dependents(&self, relation: Relation, source: TagServiceId) -> Vec<TagServiceId> {
        self.tag_services().filter(|service| self.applicable(relation, *service).contains(&source)).collect()
    }

    /// Services whose actual view depends on any edge asserted on `source`.
    ///
    /// Sibling edges move ideal tags, which parent closures are keyed on, so a
    /// sibling change on `source` concerns parent dependents too.
    pub fn display_dependents(&self, source: TagServiceId) -> Vec<TagServiceId> {
        let mut services = BTreeSet::new();
        services.extend(self.dependents(Relation::Siblings, source));
        services.extend(self.dependents(Relation::Parents, source));
        services.into_iter().collect()
    }

    /// Every service whose edges feed `service`'s actual view.
    pub fn edge_sources(&self, service: TagServiceId) -> Vec<TagServiceId> {
        let mut services = BTreeSet::new();
        services.extend(self.applicable(Relation::Siblings, service));
        services.extend(self.applicable(Relation::Parents, service));
        services.into_iter().collect()
    }
}
