//! The cache engine: one logical worker applying every change in its own
//! transaction.
//!
//! [`TagCache`] owns the database and the collaborators, serialises every
//! operation behind a single async mutex, and makes sure that whatever one
//! operation changes (storage rows, display rows, counts, lookups, the search
//! index) lands in one commit or not at all.

use crate::counts::{AppliedCounts, CountChanges, CountsStore, TagCounts};
use crate::db::Database;
use crate::definitions::TagDefinitions;
use crate::display::DisplayCoordinator;
use crate::display_mappings::DisplayMappingsCache;
use crate::error::{ErrorKind, Result};
use crate::filter::{Layer, MappingFilter};
use crate::ids::{ContentStatus, FileServiceId, HashId, MappingScope, TagDisplayType, TagId, TagServiceId};
use crate::ledger::{self, ScopeKind};
use crate::membership::FileDomainMembership;
use crate::search::{SearchIndex, TagSuggestion};
use crate::services::{Relation, ServiceRegistry};
use crate::storage::{MappingOp, StorageMappingsCache, Transitions};
use crate::verify::{Completion, ConsistencyChecker, ConsistencyReport};
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[cfg(test)]
mod tests;

/// Tuning knobs for long-running work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Items processed between cancellation checks in long scans.
    pub cancel_check_interval: usize,
    /// Chain tags regenerated per committed chunk by [`TagCache::sync_chunk`].
    pub sync_chunk_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { cancel_check_interval: 64, sync_chunk_size: 256 }
    }
}

/// Progress of a checkpointed regeneration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Chain tags regenerated by this chunk.
    pub processed: usize,
    /// Chain tags still queued afterwards.
    pub remaining: u64,
}

impl SyncProgress {
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

pub struct TagCache {
    db: Database,
    registry: Arc<ServiceRegistry>,
    membership: Arc<dyn FileDomainMembership>,
    definitions: Arc<dyn TagDefinitions>,
    settings: CacheSettings,
    worker: Mutex<()>,
}

impl TagCache {
    /// Open the engine on an already-connected database.
    ///
    /// Fails with [`ErrorKind::NeedsRecovery`] when raw source tables are
    /// missing. Any scope or service lookup that was never generated (or was
    /// quarantined) is generated before this returns.
    #[instrument(skip_all)]
    pub async fn open(
        db: Database,
        registry: Arc<ServiceRegistry>,
        membership: Arc<dyn FileDomainMembership>,
        definitions: Arc<dyn TagDefinitions>,
        settings: CacheSettings,
    ) -> Result<Self> {
        db.verify_source_tables().await?;
        let cache = Self { db, registry, membership, definitions, settings, worker: Mutex::new(()) };
        let generated = cache.generate_missing().await?;
        if generated > 0 {
            tracing::info!(generated, "Generated missing cache scopes");
        }
        Ok(cache)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn close(&self) {
        let _worker = self.worker.lock().await;
        self.db.close().await;
    }

    fn storage(&self) -> StorageMappingsCache<'_> {
        StorageMappingsCache::new(&self.registry, self.membership.as_ref())
    }

    fn coordinator(&self) -> DisplayCoordinator<'_> {
        DisplayCoordinator::new(&self.registry)
    }

    fn search_index(&self) -> SearchIndex<'_> {
        SearchIndex::new(&self.registry)
    }

    /// Apply collected count changes and keep the search index in step with
    /// every tag they touched.
    async fn settle(&self, conn: &mut SqliteConnection, changes: CountChanges) -> Result<AppliedCounts> {
        let applied = changes.apply(conn).await?;
        let mut by_scope: BTreeMap<MappingScope, BTreeSet<TagId>> = BTreeMap::new();
        for (scope, tag) in &applied.touched {
            by_scope.entry(*scope).or_default().insert(*tag);
        }
        let index = self.search_index();
        for (scope, tags) in by_scope {
            index.sync(conn, scope, &tags).await?;
        }
        Ok(applied)
    }

    // =========================================================================
    // Generation and repair
    // =========================================================================

    /// Generate every service lookup and every scope not recorded as ready.
    /// Returns how many were generated.
    pub async fn generate_missing(&self) -> Result<usize> {
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let mut generated = 0;
        for service in self.registry.tag_services() {
            if !ledger::is_generated(&mut tx, ScopeKind::Lookups, MappingScope::combined(service)).await? {
                self.generate_lookups(&mut tx, service).await?;
                generated += 1;
            }
        }
        for scope in self.registry.all_scopes() {
            let storage = ledger::is_generated(&mut tx, ScopeKind::Storage, scope).await?;
            let display = ledger::is_generated(&mut tx, ScopeKind::Display, scope).await?;
            if !storage || !display {
                self.generate_scope(&mut tx, scope).await?;
                generated += 1;
            }
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(generated)
    }

    async fn generate_lookups(&self, conn: &mut SqliteConnection, service: TagServiceId) -> Result<()> {
        let coordinator = self.coordinator();
        coordinator.regen(conn, TagDisplayType::Ideal, service).await?;
        coordinator.regen(conn, TagDisplayType::Actual, service).await?;
        ledger::mark_generated(conn, ScopeKind::Lookups, MappingScope::combined(service)).await
    }

    async fn generate_scope(&self, conn: &mut SqliteConnection, scope: MappingScope) -> Result<()> {
        let storage = self.storage();
        storage.generate(conn, scope).await?;
        ledger::mark_generated(conn, ScopeKind::Storage, scope).await?;
        storage.display().generate(conn, scope).await?;
        ledger::mark_generated(conn, ScopeKind::Display, scope).await?;
        self.search_index().rebuild(conn, scope).await?;
        Ok(())
    }

    /// Rebuild one scope's storage and display caches, counts and search
    /// index from the raw layer, lifting any quarantine.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn regenerate(&self, scope: MappingScope) -> Result<()> {
        self.registry.require_tag_service(scope.tag_service)?;
        self.registry.require_file_service(scope.file_service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        self.generate_scope(&mut tx, scope).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    /// Rebuild a tag service's lookups and then every one of its scopes.
    #[instrument(skip_all, fields(service = %service))]
    pub async fn regenerate_service(&self, service: TagServiceId) -> Result<()> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        self.generate_lookups(&mut tx, service).await?;
        for scope in self.registry.scopes_for(service) {
            self.generate_scope(&mut tx, scope).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    /// Rebuild only a scope's pending display rows.
    pub async fn regenerate_pending(&self, scope: MappingScope) -> Result<u64> {
        self.registry.require_tag_service(scope.tag_service)?;
        self.registry.require_file_service(scope.file_service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let rows = self.storage().display().regenerate_pending(&mut tx, scope).await?;
        self.search_index().rebuild(&mut tx, scope).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(rows)
    }

    /// Regenerate every quarantined scope. Returns the scopes repaired.
    #[instrument(skip_all)]
    pub async fn recover(&self) -> Result<BTreeSet<MappingScope>> {
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let quarantined = ledger::quarantined(&mut tx).await?;
        let services: BTreeSet<TagServiceId> = quarantined.iter().map(|scope| scope.tag_service).collect();
        for service in services {
            if self.registry.has_tag_service(service) {
                self.generate_lookups(&mut tx, service).await?;
            }
        }
        let mut repaired = BTreeSet::new();
        for scope in quarantined {
            if !self.registry.has_tag_service(scope.tag_service) || !self.registry.has_file_service(scope.file_service)
            {
                continue;
            }
            self.generate_scope(&mut tx, scope).await?;
            repaired.insert(scope);
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::info!(repaired = repaired.len(), "Recovered quarantined scopes");
        Ok(repaired)
    }

    /// Compare every derived table with a rebuild, quarantining whatever
    /// disagrees. A cancelled check commits nothing.
    pub async fn check_consistency(&self, cancel: &CancellationToken) -> Result<Completion<ConsistencyReport>> {
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let checker = ConsistencyChecker::new(&self.registry, self.membership.as_ref());
        let completion = checker.check_all(&mut tx, cancel, self.settings.cancel_check_interval).await?;
        let Completion::Complete(report) = completion else {
            tx.rollback().await.or_raise(|| ErrorKind::Database)?;
            return Ok(completion);
        };
        for scope in report.inconsistent_scopes(&self.registry) {
            ledger::quarantine(&mut tx, scope).await?;
        }
        for service in report.services.keys() {
            ledger::quarantine_lookups(&mut tx, *service).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(Completion::Complete(report))
    }

    // =========================================================================
    // Storage mappings
    // =========================================================================

    /// Whether `op` on an unknown service is an error or a no-op.
    fn strict(op: MappingOp) -> bool {
        matches!(op, MappingOp::Add | MappingOp::Pend)
    }

    #[instrument(skip_all, fields(op = ?op, service = %service, tag = %tag, files = hashes.len()))]
    async fn change_mappings(
        &self,
        op: MappingOp,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        if !Self::strict(op) && !self.registry.has_tag_service(service) && !service.is_combined() {
            tracing::debug!(service = %service, "Ignoring mapping change on unknown tag service");
            return Ok(Transitions::default());
        }
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        ledger::ensure_usable(&mut tx, &self.registry.scopes_for(service)).await?;
        let mut changes = CountChanges::new();
        let transitions = self.storage().apply(&mut tx, &mut changes, op, service, tag, hashes).await?;
        self.settle(&mut tx, changes).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(transitions)
    }

    pub async fn add_mappings(&self, service: TagServiceId, tag: TagId, hashes: &BTreeSet<HashId>) -> Result<Transitions> {
        self.change_mappings(MappingOp::Add, service, tag, hashes).await
    }

    pub async fn delete_mappings(
        &self,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        self.change_mappings(MappingOp::Delete, service, tag, hashes).await
    }

    pub async fn pend_mappings(&self, service: TagServiceId, tag: TagId, hashes: &BTreeSet<HashId>) -> Result<Transitions> {
        self.change_mappings(MappingOp::Pend, service, tag, hashes).await
    }

    pub async fn rescind_pending_mappings(
        &self,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<Transitions> {
        self.change_mappings(MappingOp::Rescind, service, tag, hashes).await
    }

    pub async fn petition_mappings(&self, service: TagServiceId, tag: TagId, hashes: &BTreeSet<HashId>) -> Result<u64> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let petitioned = self.storage().petition_mappings(&mut tx, service, tag, hashes).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(petitioned)
    }

    pub async fn rescind_petitioned_mappings(
        &self,
        service: TagServiceId,
        tag: TagId,
        hashes: &BTreeSet<HashId>,
    ) -> Result<u64> {
        if !self.registry.has_tag_service(service) {
            tracing::debug!(service = %service, "Ignoring petition rescind on unknown tag service");
            return Ok(0);
        }
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let rescinded = self.storage().rescind_petitioned_mappings(&mut tx, service, tag, hashes).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(rescinded)
    }

    /// Files that just entered `domain`.
    #[instrument(skip_all, fields(domain = %domain, files = hashes.len()))]
    pub async fn add_files(&self, domain: FileServiceId, hashes: &BTreeSet<HashId>) -> Result<u64> {
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let scopes: Vec<MappingScope> =
            self.registry.tag_services().map(|service| MappingScope::new(domain, service)).collect();
        ledger::ensure_usable(&mut tx, &scopes).await?;
        let mut changes = CountChanges::new();
        let copied = self.storage().add_files(&mut tx, &mut changes, domain, hashes).await?;
        self.settle(&mut tx, changes).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(copied)
    }

    /// Files that just left `domain`.
    #[instrument(skip_all, fields(domain = %domain, files = hashes.len()))]
    pub async fn delete_files(&self, domain: FileServiceId, hashes: &BTreeSet<HashId>) -> Result<u64> {
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let scopes: Vec<MappingScope> =
            self.registry.tag_services().map(|service| MappingScope::new(domain, service)).collect();
        ledger::ensure_usable(&mut tx, &scopes).await?;
        let mut changes = CountChanges::new();
        let removed = self.storage().delete_files(&mut tx, &mut changes, domain, hashes).await?;
        self.settle(&mut tx, changes).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(removed)
    }

    // =========================================================================
    // Sibling and parent edges
    // =========================================================================

    /// Regenerate every view `relation` edges on `service` feed, around
    /// `changed`, and push the implication changes into the display caches.
    async fn edges_changed(
        &self,
        conn: &mut SqliteConnection,
        relation: Relation,
        service: TagServiceId,
        changed: &BTreeSet<TagId>,
    ) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        self.coordinator().regen_chains(conn, TagDisplayType::Ideal, service, changed).await?;
        let dependents = self.dependents(relation, service);
        self.apply_chain_changes(conn, &dependents, changed).await
    }

    /// Services whose actual view moves when `relation` edges on `service`
    /// change. Sibling edges move ideals, which parent rows are keyed on.
    fn dependents(&self, relation: Relation, service: TagServiceId) -> Vec<TagServiceId> {
        match relation {
            Relation::Siblings => self.registry.display_dependents(service),
            Relation::Parents => self.registry.dependents(Relation::Parents, service),
        }
    }

    async fn apply_chain_changes(
        &self,
        conn: &mut SqliteConnection,
        services: &[TagServiceId],
        changed: &BTreeSet<TagId>,
    ) -> Result<()> {
        let coordinator = self.coordinator();
        let display = DisplayMappingsCache::new(&self.registry);
        let index = self.search_index();
        let mut changes = CountChanges::new();
        for service in services.iter().copied() {
            let delta = coordinator.regen_chains(conn, TagDisplayType::Actual, service, changed).await?;
            for scope in self.registry.scopes_for(service) {
                display.apply_delta(conn, &mut changes, scope, &delta).await?;
                index.sync(conn, scope, &delta.touched).await?;
            }
        }
        self.settle(conn, changes).await?;
        Ok(())
    }

    async fn change_edges(
        &self,
        relation: Relation,
        service: TagServiceId,
        pairs: &[(TagId, TagId)],
        status: Option<ContentStatus>,
    ) -> Result<Vec<(TagId, TagId)>> {
        if status.is_none() && !self.registry.has_tag_service(service) {
            tracing::debug!(service = %service, "Ignoring edge removal on unknown tag service");
            return Ok(Vec::new());
        }
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let scopes: Vec<MappingScope> = self
            .dependents(relation, service)
            .into_iter()
            .flat_map(|dependent| self.registry.scopes_for(dependent))
            .collect();
        ledger::ensure_usable(&mut tx, &scopes).await?;
        let coordinator = self.coordinator();
        let changed_edges = match (relation, status) {
            (Relation::Siblings, Some(status)) => {
                coordinator.siblings().add_edges(&mut tx, service, pairs, status).await?
            },
            (Relation::Siblings, None) => coordinator.siblings().remove_edges(&mut tx, service, pairs).await?,
            (Relation::Parents, Some(status)) => coordinator.parents().add_edges(&mut tx, service, pairs, status).await?,
            (Relation::Parents, None) => coordinator.parents().remove_edges(&mut tx, service, pairs).await?,
        };
        let changed: BTreeSet<TagId> = changed_edges.iter().flat_map(|(from, to)| [*from, *to]).collect();
        self.edges_changed(&mut tx, relation, service, &changed).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(changed_edges)
    }

    /// Assert `bad → good` sibling edges. Returns the edges accepted; cycle
    /// closing and self edges are dropped.
    #[instrument(skip_all, fields(service = %service, edges = pairs.len()))]
    pub async fn add_siblings(
        &self,
        service: TagServiceId,
        pairs: &[(TagId, TagId)],
        status: ContentStatus,
    ) -> Result<Vec<(TagId, TagId)>> {
        self.change_edges(Relation::Siblings, service, pairs, Some(status)).await
    }

    #[instrument(skip_all, fields(service = %service, edges = pairs.len()))]
    pub async fn remove_siblings(&self, service: TagServiceId, pairs: &[(TagId, TagId)]) -> Result<Vec<(TagId, TagId)>> {
        self.change_edges(Relation::Siblings, service, pairs, None).await
    }

    /// Assert `child → parent` edges. Returns the edges accepted.
    #[instrument(skip_all, fields(service = %service, edges = pairs.len()))]
    pub async fn add_parents(
        &self,
        service: TagServiceId,
        pairs: &[(TagId, TagId)],
        status: ContentStatus,
    ) -> Result<Vec<(TagId, TagId)>> {
        self.change_edges(Relation::Parents, service, pairs, Some(status)).await
    }

    #[instrument(skip_all, fields(service = %service, edges = pairs.len()))]
    pub async fn remove_parents(&self, service: TagServiceId, pairs: &[(TagId, TagId)]) -> Result<Vec<(TagId, TagId)>> {
        self.change_edges(Relation::Parents, service, pairs, None).await
    }

    // =========================================================================
    // Checkpointed regeneration
    // =========================================================================

    /// Queue every chain tag of `service`'s views for regeneration in chunks.
    /// Returns how many tags are queued.
    pub async fn queue_regen(&self, service: TagServiceId) -> Result<u64> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let coordinator = self.coordinator();
        let mut tags = BTreeSet::new();
        for display_type in [TagDisplayType::Ideal, TagDisplayType::Actual] {
            let siblings = coordinator.siblings();
            for map in [
                siblings.lookup(&mut tx, display_type, service).await?,
                siblings.resolve(&mut tx, display_type, service).await?,
            ] {
                for (bad, ideal) in map {
                    tags.insert(bad);
                    tags.insert(ideal);
                }
            }
            let parents = coordinator.parents();
            for map in [
                parents.lookup(&mut tx, display_type, service).await?,
                parents.resolve(&mut tx, display_type, service).await?,
            ] {
                for (child, ancestors) in map {
                    tags.insert(child);
                    tags.extend(ancestors);
                }
            }
        }
        ledger::enqueue(&mut tx, service, &tags).await?;
        let queued = ledger::queued(&mut tx, service).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::info!(service = %service, queued, "Queued chain regeneration");
        Ok(queued)
    }

    /// Chain tags of `service` still waiting for [`sync_chunk`](Self::sync_chunk).
    pub async fn queued(&self, service: TagServiceId) -> Result<u64> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        ledger::queued(&mut conn, service).await
    }

    /// Regenerate the chains of up to one chunk of queued tags and commit.
    ///
    /// Each chunk regenerates whole closures, so running a chunk twice (say,
    /// after a crash between regenerating and committing) changes nothing.
    #[instrument(level = "debug", skip_all, fields(service = %service))]
    pub async fn sync_chunk(&self, service: TagServiceId) -> Result<SyncProgress> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let chunk = ledger::peek(&mut tx, service, self.settings.sync_chunk_size.max(1)).await?;
        if chunk.is_empty() {
            return Ok(SyncProgress::default());
        }
        ledger::ensure_usable(&mut tx, &self.registry.scopes_for(service)).await?;
        self.coordinator().regen_chains(&mut tx, TagDisplayType::Ideal, service, &chunk).await?;
        self.apply_chain_changes(&mut tx, &[service], &chunk).await?;
        ledger::dequeue(&mut tx, service, &chunk).await?;
        let remaining = ledger::queued(&mut tx, service).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::debug!(service = %service, processed = chunk.len(), remaining, "Synced chain chunk");
        Ok(SyncProgress { processed: chunk.len(), remaining })
    }

    /// Run [`sync_chunk`](Self::sync_chunk) until the queue is empty or
    /// `cancel` fires. Committed chunks stay committed either way.
    pub async fn sync_all(&self, service: TagServiceId, cancel: &CancellationToken) -> Result<Completion<usize>> {
        let mut processed = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(Completion::Incomplete(processed));
            }
            let progress = self.sync_chunk(service).await?;
            processed += progress.processed;
            if progress.is_done() {
                return Ok(Completion::Complete(processed));
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_counts(
        &self,
        display_type: TagDisplayType,
        file_service: FileServiceId,
        tag_service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<BTreeMap<TagId, TagCounts>> {
        self.registry.require_file_service(file_service)?;
        if !tag_service.is_combined() {
            self.registry.require_tag_service(tag_service)?;
        }
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        CountsStore::new(&self.registry).get_counts(&mut conn, display_type, file_service, tag_service, tags).await
    }

    /// Files carrying `tag` with `status` in one of `scope`'s caches.
    pub async fn hashes(
        &self,
        display_type: TagDisplayType,
        scope: MappingScope,
        tag: TagId,
        status: ContentStatus,
    ) -> Result<BTreeSet<HashId>> {
        self.registry.require_tag_service(scope.tag_service)?;
        self.registry.require_file_service(scope.file_service)?;
        let layer = match display_type {
            TagDisplayType::Storage => Layer::Storage,
            TagDisplayType::Ideal | TagDisplayType::Actual => Layer::Display,
        };
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        MappingFilter::new(layer, scope, status).tagged(&mut conn, &BTreeSet::from([tag])).await
    }

    pub async fn ideal(&self, display_type: TagDisplayType, service: TagServiceId, tag: TagId) -> Result<TagId> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.coordinator().siblings().ideal(&mut conn, display_type, service, tag).await
    }

    pub async fn chain_members(
        &self,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideal: TagId,
    ) -> Result<BTreeSet<TagId>> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.coordinator().siblings().chain_members(&mut conn, display_type, service, ideal).await
    }

    pub async fn ancestors(
        &self,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideal: TagId,
    ) -> Result<BTreeSet<TagId>> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.coordinator().parents().ancestors(&mut conn, display_type, service, ideal).await
    }

    pub async fn descendants(
        &self,
        display_type: TagDisplayType,
        service: TagServiceId,
        ideal: TagId,
    ) -> Result<BTreeSet<TagId>> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.coordinator().parents().descendants(&mut conn, display_type, service, ideal).await
    }

    pub async fn implies(&self, display_type: TagDisplayType, service: TagServiceId, tag: TagId) -> Result<BTreeSet<TagId>> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.coordinator().implies(&mut conn, display_type, service, tag).await
    }

    pub async fn implied_by(
        &self,
        display_type: TagDisplayType,
        service: TagServiceId,
        tag: TagId,
    ) -> Result<BTreeSet<TagId>> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.coordinator().implied_by(&mut conn, display_type, service, tag).await
    }

    pub async fn is_chained(&self, display_type: TagDisplayType, service: TagServiceId, tag: TagId) -> Result<bool> {
        self.registry.require_tag_service(service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.coordinator().is_chained(&mut conn, display_type, service, tag).await
    }

    /// Annotate `tags` for presentation.
    pub async fn annotate(
        &self,
        display_type: TagDisplayType,
        file_service: FileServiceId,
        tag_service: TagServiceId,
        tags: &BTreeSet<TagId>,
    ) -> Result<Vec<TagSuggestion>> {
        self.registry.require_file_service(file_service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.search_index()
            .annotate(&mut conn, self.definitions.as_ref(), display_type, file_service, tag_service, tags)
            .await
    }

    /// Autocomplete `prefix` against the searchable tags of a scope.
    pub async fn search(
        &self,
        file_service: FileServiceId,
        tag_service: TagServiceId,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<TagSuggestion>> {
        self.registry.require_file_service(file_service)?;
        let _worker = self.worker.lock().await;
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        self.search_index()
            .search(&mut conn, self.definitions.as_ref(), file_service, tag_service, prefix, limit)
            .await
    }
}
