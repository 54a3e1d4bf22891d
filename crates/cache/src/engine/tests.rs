use super::*;
use crate::definitions::MemoryTagDefinitions;
use crate::membership::MemoryMembership;

const TAGS: TagServiceId = TagServiceId(1);
const DOMAIN: FileServiceId = FileServiceId(1);
const SCOPE: MappingScope = MappingScope { file_service: DOMAIN, tag_service: TAGS };

struct Harness {
    db: Database,
    membership: Arc<MemoryMembership>,
    definitions: Arc<MemoryTagDefinitions>,
    cache: TagCache,
}

impl Harness {
    async fn new() -> Self {
        Self::with_settings(CacheSettings::default()).await
    }

    async fn with_settings(settings: CacheSettings) -> Self {
        let db = Database::connect_in_memory().await.unwrap();
        let membership = Arc::new(MemoryMembership::new());
        let definitions = Arc::new(MemoryTagDefinitions::new());
        let cache = Self::open(&db, &membership, &definitions, settings).await;
        Self { db, membership, definitions, cache }
    }

    async fn open(
        db: &Database,
        membership: &Arc<MemoryMembership>,
        definitions: &Arc<MemoryTagDefinitions>,
        settings: CacheSettings,
    ) -> TagCache {
        let registry = ServiceRegistry::new().with_file_service(DOMAIN).unwrap().with_tag_service(TAGS).unwrap();
        TagCache::open(db.clone(), Arc::new(registry), membership.clone(), definitions.clone(), settings).await.unwrap()
    }

    async fn reopen(&self) -> TagCache {
        Self::open(&self.db, &self.membership, &self.definitions, self.cache.settings()).await
    }

    fn tag(&self, text: &str) -> TagId {
        self.definitions.intern(text)
    }

    /// Files `ids`, already members of the domain.
    fn files(&self, ids: impl IntoIterator<Item = i64>) -> BTreeSet<HashId> {
        let hashes: BTreeSet<HashId> = ids.into_iter().map(HashId).collect();
        self.membership.insert(DOMAIN, hashes.iter().copied());
        hashes
    }

    async fn add(&self, tag: TagId, ids: impl IntoIterator<Item = i64>) {
        let hashes = self.files(ids);
        self.cache.add_mappings(TAGS, tag, &hashes).await.unwrap();
    }

    async fn pend(&self, tag: TagId, ids: impl IntoIterator<Item = i64>) {
        let hashes = self.files(ids);
        self.cache.pend_mappings(TAGS, tag, &hashes).await.unwrap();
    }

    async fn counts(&self, display_type: TagDisplayType, tag: TagId) -> Option<TagCounts> {
        let counts = self.cache.get_counts(display_type, DOMAIN, TAGS, &BTreeSet::from([tag])).await.unwrap();
        counts.get(&tag).copied()
    }

    async fn displayed(&self, tag: TagId, status: ContentStatus) -> BTreeSet<HashId> {
        self.cache.hashes(TagDisplayType::Actual, SCOPE, tag, status).await.unwrap()
    }

    async fn assert_consistent(&self) {
        let report = self.cache.check_consistency(&CancellationToken::new()).await.unwrap().into_inner();
        assert!(report.is_consistent(), "{report:?}");
    }
}

fn hashes(ids: impl IntoIterator<Item = i64>) -> BTreeSet<HashId> {
    ids.into_iter().map(HashId).collect()
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test]
async fn new_sibling_moves_current_and_pending_counts() {
    let h = Harness::new().await;
    let (kitten, cat) = (h.tag("kitten"), h.tag("cat"));
    h.add(kitten, [1, 2, 3]).await;
    h.pend(kitten, [4, 5]).await;
    assert_eq!(h.counts(TagDisplayType::Actual, cat).await, None);

    let accepted = h.cache.add_siblings(TAGS, &[(kitten, cat)], ContentStatus::Current).await.unwrap();
    assert_eq!(accepted, vec![(kitten, cat)]);

    assert_eq!(h.counts(TagDisplayType::Actual, cat).await, Some(TagCounts::exact(3, 2)));
    assert_eq!(h.counts(TagDisplayType::Actual, kitten).await, None);
    // Storage counts are literal and don't move.
    assert_eq!(h.counts(TagDisplayType::Storage, kitten).await, Some(TagCounts::exact(3, 2)));
    assert_eq!(h.counts(TagDisplayType::Storage, cat).await, None);
    h.assert_consistent().await;
}

#[tokio::test]
async fn new_parent_reaches_whole_chain_without_double_counting() {
    let h = Harness::new().await;
    let (kitten, cat, animal) = (h.tag("kitten"), h.tag("cat"), h.tag("animal"));
    h.cache.add_siblings(TAGS, &[(kitten, cat)], ContentStatus::Current).await.unwrap();
    h.add(cat, [1, 2]).await;
    h.add(kitten, [3]).await;
    h.add(animal, [2, 4]).await;
    assert_eq!(h.counts(TagDisplayType::Actual, animal).await, Some(TagCounts::exact(2, 0)));

    h.cache.add_parents(TAGS, &[(cat, animal)], ContentStatus::Current).await.unwrap();

    assert_eq!(h.displayed(animal, ContentStatus::Current).await, hashes([1, 2, 3, 4]));
    assert_eq!(h.counts(TagDisplayType::Actual, animal).await, Some(TagCounts::exact(4, 0)));
    assert_eq!(h.counts(TagDisplayType::Actual, cat).await, Some(TagCounts::exact(3, 0)));
    assert_eq!(
        h.cache.implied_by(TagDisplayType::Actual, TAGS, animal).await.unwrap(),
        BTreeSet::from([animal, cat, kitten])
    );
    h.assert_consistent().await;
}

#[tokio::test]
async fn file_leaving_domain_drops_its_rows() {
    let h = Harness::new().await;
    let (a, b, c) = (h.tag("a"), h.tag("b"), h.tag("c"));
    h.add(a, [1, 2]).await;
    h.add(b, [1]).await;
    h.pend(c, [1]).await;

    h.membership.remove(DOMAIN, [HashId(1)]);
    let removed = h.cache.delete_files(DOMAIN, &hashes([1])).await.unwrap();
    assert_eq!(removed, 3);

    for display_type in [TagDisplayType::Storage, TagDisplayType::Actual] {
        assert_eq!(h.counts(display_type, a).await, Some(TagCounts::exact(1, 0)));
        assert_eq!(h.counts(display_type, b).await, None);
        assert_eq!(h.counts(display_type, c).await, None);
    }
    assert!(h.displayed(c, ContentStatus::Pending).await.is_empty());
    // The raw layer keeps the assertions.
    let raw = h.cache.get_counts(TagDisplayType::Storage, FileServiceId::COMBINED, TAGS, &BTreeSet::from([b])).await;
    assert_eq!(raw.unwrap().get(&b), Some(&TagCounts::exact(1, 0)));
    h.assert_consistent().await;
}

#[tokio::test]
async fn files_moving_in_and_out_around_mapping_changes() {
    let h = Harness::new().await;
    let (kitten, cat, animal) = (h.tag("kitten"), h.tag("cat"), h.tag("animal"));
    h.cache.add_siblings(TAGS, &[(kitten, cat)], ContentStatus::Current).await.unwrap();
    h.cache.add_parents(TAGS, &[(cat, animal)], ContentStatus::Current).await.unwrap();
    // Mapped before any of these files are in the domain.
    h.cache.add_mappings(TAGS, kitten, &hashes([1, 2])).await.unwrap();
    h.cache.pend_mappings(TAGS, cat, &hashes([3])).await.unwrap();
    assert_eq!(h.counts(TagDisplayType::Actual, cat).await, None);

    // File 1 joins and picks up cat straight away, before it is announced.
    h.add(cat, [1]).await;
    assert_eq!(h.counts(TagDisplayType::Actual, cat).await, Some(TagCounts::exact(1, 0)));
    assert_eq!(h.counts(TagDisplayType::Storage, kitten).await, None);

    h.membership.insert(DOMAIN, [HashId(3)]);
    // File 2 never joined.
    let copied = h.cache.add_files(DOMAIN, &hashes([1, 2, 3])).await.unwrap();
    assert_eq!(copied, 2);
    assert_eq!(h.counts(TagDisplayType::Storage, kitten).await, Some(TagCounts::exact(1, 0)));
    assert_eq!(h.counts(TagDisplayType::Storage, cat).await, Some(TagCounts::exact(1, 1)));
    assert_eq!(h.counts(TagDisplayType::Actual, cat).await, Some(TagCounts::exact(1, 1)));
    assert_eq!(h.counts(TagDisplayType::Actual, animal).await, Some(TagCounts::exact(1, 1)));
    assert_eq!(h.displayed(animal, ContentStatus::Pending).await, hashes([3]));
    h.assert_consistent().await;

    assert_eq!(h.cache.add_files(DOMAIN, &hashes([1, 3])).await.unwrap(), 0);

    h.membership.remove(DOMAIN, [HashId(1)]);
    assert_eq!(h.cache.delete_files(DOMAIN, &hashes([1])).await.unwrap(), 2);
    assert_eq!(h.counts(TagDisplayType::Actual, cat).await, Some(TagCounts::exact(0, 1)));
    assert_eq!(h.counts(TagDisplayType::Storage, kitten).await, None);
    assert!(h.displayed(animal, ContentStatus::Current).await.is_empty());
    h.assert_consistent().await;

    h.membership.insert(DOMAIN, [HashId(1)]);
    assert_eq!(h.cache.add_files(DOMAIN, &hashes([1])).await.unwrap(), 2);
    assert_eq!(h.counts(TagDisplayType::Actual, animal).await, Some(TagCounts::exact(1, 1)));
    h.assert_consistent().await;
}

#[tokio::test]
async fn removing_one_sibling_keeps_other_paths() {
    let h = Harness::new().await;
    let (bad, bad2, good) = (h.tag("bad"), h.tag("bad2"), h.tag("good"));
    h.add(bad, [1, 2, 3]).await;
    h.add(bad2, [2, 4]).await;
    h.add(good, [3]).await;
    h.cache.add_siblings(TAGS, &[(bad, good), (bad2, good)], ContentStatus::Current).await.unwrap();
    assert_eq!(h.counts(TagDisplayType::Actual, good).await, Some(TagCounts::exact(4, 0)));

    let removed = h.cache.remove_siblings(TAGS, &[(bad, good)]).await.unwrap();
    assert_eq!(removed, vec![(bad, good)]);

    assert_eq!(h.displayed(good, ContentStatus::Current).await, hashes([2, 3, 4]));
    assert_eq!(h.counts(TagDisplayType::Actual, good).await, Some(TagCounts::exact(3, 0)));
    assert_eq!(h.counts(TagDisplayType::Actual, bad).await, Some(TagCounts::exact(3, 0)));
    h.assert_consistent().await;
}

// =========================================================================
// Properties
// =========================================================================

#[tokio::test]
async fn sibling_chains_resolve_in_one_hop() {
    let h = Harness::new().await;
    let [a, b, c, d] = ["a", "b", "c", "d"].map(|text| h.tag(text));
    h.cache.add_siblings(TAGS, &[(a, b), (b, c), (d, a)], ContentStatus::Current).await.unwrap();
    for tag in [a, b, c, d] {
        let ideal = h.cache.ideal(TagDisplayType::Actual, TAGS, tag).await.unwrap();
        assert_eq!(ideal, c);
        assert_eq!(h.cache.ideal(TagDisplayType::Actual, TAGS, ideal).await.unwrap(), ideal);
    }
    assert_eq!(h.cache.chain_members(TagDisplayType::Ideal, TAGS, c).await.unwrap(), BTreeSet::from([a, b, c, d]));
}

#[tokio::test]
async fn cycles_are_dropped() {
    let h = Harness::new().await;
    let [a, b, c] = ["a", "b", "c"].map(|text| h.tag(text));
    let accepted = h.cache.add_siblings(TAGS, &[(a, b), (b, a), (c, c)], ContentStatus::Current).await.unwrap();
    assert_eq!(accepted, vec![(a, b)]);
    let accepted = h.cache.add_parents(TAGS, &[(a, c), (c, a)], ContentStatus::Current).await.unwrap();
    assert_eq!(accepted.len(), 1);
}

#[tokio::test]
async fn ancestor_closure_is_transitive_and_irreflexive() {
    let h = Harness::new().await;
    let [a, b, c, d] = ["a", "b", "c", "d"].map(|text| h.tag(text));
    h.cache.add_parents(TAGS, &[(a, b), (b, c), (d, c)], ContentStatus::Current).await.unwrap();
    for tag in [a, b, c, d] {
        let ancestors = h.cache.ancestors(TagDisplayType::Actual, TAGS, tag).await.unwrap();
        assert!(!ancestors.contains(&tag));
        for ancestor in &ancestors {
            let further = h.cache.ancestors(TagDisplayType::Actual, TAGS, *ancestor).await.unwrap();
            assert!(further.is_subset(&ancestors), "{tag} → {ancestor}");
        }
    }
    assert_eq!(h.cache.ancestors(TagDisplayType::Actual, TAGS, a).await.unwrap(), BTreeSet::from([b, c]));
    assert_eq!(h.cache.descendants(TagDisplayType::Actual, TAGS, c).await.unwrap(), BTreeSet::from([a, b, d]));
    assert!(h.cache.is_chained(TagDisplayType::Actual, TAGS, d).await.unwrap());
}

#[tokio::test]
async fn incremental_chains_match_full_regen() {
    let h = Harness::new().await;
    let [a, b, c, d, e] = ["a", "b", "c", "d", "e"].map(|text| h.tag(text));
    h.add(a, [1, 2]).await;
    h.add(d, [3]).await;
    h.pend(e, [1, 4]).await;
    h.cache.add_siblings(TAGS, &[(a, b), (c, b)], ContentStatus::Current).await.unwrap();
    h.cache.add_parents(TAGS, &[(b, d), (d, e)], ContentStatus::Pending).await.unwrap();
    h.cache.add_siblings(TAGS, &[(b, d)], ContentStatus::Current).await.unwrap();
    h.cache.remove_siblings(TAGS, &[(a, b)]).await.unwrap();
    h.cache.remove_parents(TAGS, &[(d, e)]).await.unwrap();
    h.cache.add_parents(TAGS, &[(a, e)], ContentStatus::Current).await.unwrap();
    let incremental = h.cache.implies(TagDisplayType::Actual, TAGS, a).await.unwrap();
    h.assert_consistent().await;

    h.cache.regenerate_service(TAGS).await.unwrap();
    assert_eq!(h.cache.implies(TagDisplayType::Actual, TAGS, a).await.unwrap(), incremental);
    h.assert_consistent().await;
}

#[tokio::test]
async fn counts_match_recount_after_mixed_changes() {
    let h = Harness::new().await;
    let tags = ["x", "y", "z"].map(|text| h.tag(text));
    let ops = [MappingOp::Add, MappingOp::Pend, MappingOp::Delete, MappingOp::Rescind];
    // Deterministic walk over every op on overlapping file sets.
    let mut seed = 7u64;
    for _ in 0..40 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let tag = tags[(seed >> 33) as usize % tags.len()];
        let op = ops[(seed >> 41) as usize % ops.len()];
        let start = (seed >> 50) as i64 % 6;
        let files = h.files(start..start + 3);
        h.cache.change_mappings(op, TAGS, tag, &files).await.unwrap();
    }
    h.assert_consistent().await;
}

#[tokio::test]
async fn rescind_without_pend_and_repeated_pend_change_nothing() {
    let h = Harness::new().await;
    let tag = h.tag("tag");
    let files = h.files([1, 2]);
    h.cache.add_mappings(TAGS, tag, &files).await.unwrap();
    let rescinded = h.cache.rescind_pending_mappings(TAGS, tag, &files).await.unwrap();
    assert!(rescinded.is_empty());
    assert_eq!(h.counts(TagDisplayType::Storage, tag).await, Some(TagCounts::exact(2, 0)));

    let other = h.tag("other");
    h.pend(other, [3]).await;
    let once = h.counts(TagDisplayType::Actual, other).await;
    let again = h.cache.pend_mappings(TAGS, other, &hashes([3])).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(h.counts(TagDisplayType::Actual, other).await, once);
    assert_eq!(once, Some(TagCounts::exact(0, 1)));
}

// =========================================================================
// Services and recovery
// =========================================================================

#[tokio::test]
async fn unknown_services_are_strict_for_adds_only() {
    let h = Harness::new().await;
    let tag = h.tag("tag");
    let files = h.files([1]);
    let unknown = TagServiceId(9);

    let err = h.cache.add_mappings(unknown, tag, &files).await.unwrap_err();
    assert_eq!(*err, ErrorKind::TagServiceNotFound(unknown));
    let err = h.cache.add_siblings(unknown, &[(tag, tag)], ContentStatus::Current).await.unwrap_err();
    assert_eq!(*err, ErrorKind::TagServiceNotFound(unknown));
    let err = h.cache.add_mappings(TagServiceId::COMBINED, tag, &files).await.unwrap_err();
    assert_eq!(*err, ErrorKind::CombinedService);

    assert!(h.cache.delete_mappings(unknown, tag, &files).await.unwrap().is_empty());
    assert!(h.cache.rescind_pending_mappings(unknown, tag, &files).await.unwrap().is_empty());
    assert!(h.cache.remove_parents(unknown, &[(tag, tag)]).await.unwrap().is_empty());
    assert_eq!(h.cache.delete_files(FileServiceId(9), &files).await.unwrap(), 0);
}

#[tokio::test]
async fn open_fails_without_source_tables() {
    let db = Database::connect_in_memory().await.unwrap();
    sqlx::query("DROP TABLE tag_siblings").execute(db.pool()).await.unwrap();
    let registry = Arc::new(ServiceRegistry::new());
    let result = TagCache::open(
        db,
        registry,
        Arc::new(MemoryMembership::new()),
        Arc::new(MemoryTagDefinitions::new()),
        CacheSettings::default(),
    )
    .await;
    assert_eq!(*result.err().unwrap(), ErrorKind::NeedsRecovery);
}

#[tokio::test]
async fn open_regenerates_missing_scopes() {
    let h = Harness::new().await;
    let (kitten, cat) = (h.tag("kitten"), h.tag("cat"));
    h.cache.add_siblings(TAGS, &[(kitten, cat)], ContentStatus::Current).await.unwrap();
    h.add(kitten, [1, 2]).await;

    sqlx::query("DELETE FROM display_mappings").execute(h.db.pool()).await.unwrap();
    sqlx::query("DELETE FROM tag_counts WHERE display_type = 2").execute(h.db.pool()).await.unwrap();
    sqlx::query("DELETE FROM generated_scopes WHERE kind = 1").execute(h.db.pool()).await.unwrap();

    let cache = h.reopen().await;
    let counts = cache.get_counts(TagDisplayType::Actual, DOMAIN, TAGS, &BTreeSet::from([cat])).await.unwrap();
    assert_eq!(counts.get(&cat), Some(&TagCounts::exact(2, 0)));
}

#[tokio::test]
async fn inconsistent_scope_is_quarantined_until_recovered() {
    let h = Harness::new().await;
    let tag = h.tag("tag");
    h.add(tag, [1, 2]).await;
    sqlx::query("UPDATE tag_counts SET current_count = 7 WHERE display_type = 2 AND file_service_id = 1")
        .execute(h.db.pool())
        .await
        .unwrap();

    let report = h.cache.check_consistency(&CancellationToken::new()).await.unwrap().into_inner();
    assert!(!report.is_consistent());
    assert!(report.scopes.contains_key(&SCOPE));

    let err = h.cache.add_mappings(TAGS, tag, &h.files([3])).await.unwrap_err();
    assert_eq!(*err, ErrorKind::Consistency(SCOPE));

    let repaired = h.cache.recover().await.unwrap();
    assert!(repaired.contains(&SCOPE));
    assert_eq!(h.counts(TagDisplayType::Actual, tag).await, Some(TagCounts::exact(2, 0)));
    h.add(tag, [3]).await;
    assert_eq!(h.counts(TagDisplayType::Actual, tag).await, Some(TagCounts::exact(3, 0)));
    h.assert_consistent().await;
}

#[tokio::test]
async fn cancelled_check_quarantines_nothing() {
    let h = Harness::new().await;
    let tag = h.tag("tag");
    h.add(tag, [1]).await;
    sqlx::query("UPDATE tag_counts SET current_count = 5 WHERE display_type = 0").execute(h.db.pool()).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let completion = h.cache.check_consistency(&cancel).await.unwrap();
    assert!(!completion.is_complete());
    // Nothing was quarantined, so changes still go through.
    h.add(tag, [2]).await;
}

#[tokio::test]
async fn checkpointed_sync_converges_after_restart() {
    let h = Harness::with_settings(CacheSettings { sync_chunk_size: 1, ..CacheSettings::default() }).await;
    let [a, b, c, d] = ["a", "b", "c", "d"].map(|text| h.tag(text));
    h.add(a, [1]).await;
    h.add(c, [2]).await;
    h.cache.add_siblings(TAGS, &[(a, b)], ContentStatus::Current).await.unwrap();
    h.cache.add_parents(TAGS, &[(b, c), (d, c)], ContentStatus::Current).await.unwrap();
    let before = h.cache.implies(TagDisplayType::Actual, TAGS, a).await.unwrap();

    let queued = h.cache.queue_regen(TAGS).await.unwrap();
    assert_eq!(queued, 4);
    let progress = h.cache.sync_chunk(TAGS).await.unwrap();
    assert_eq!(progress, SyncProgress { processed: 1, remaining: 3 });

    // A new engine picks the queue up where the last one left off.
    let cache = h.reopen().await;
    let completion = cache.sync_all(TAGS, &CancellationToken::new()).await.unwrap();
    assert_eq!(completion, Completion::Complete(3));
    assert!(cache.sync_chunk(TAGS).await.unwrap().is_done());
    assert_eq!(cache.implies(TagDisplayType::Actual, TAGS, a).await.unwrap(), before);
    let report = cache.check_consistency(&CancellationToken::new()).await.unwrap().into_inner();
    assert!(report.is_consistent(), "{report:?}");
}

#[tokio::test]
async fn search_ranks_displayed_tags() {
    let h = Harness::new().await;
    let (cat, car, cave) = (h.tag("cat"), h.tag("car"), h.tag("cave"));
    h.add(cat, [1, 2, 3]).await;
    h.add(car, [4]).await;
    h.add(cave, [5]).await;
    h.cache.delete_mappings(TAGS, cave, &hashes([5])).await.unwrap();

    let found = h.cache.search(DOMAIN, TAGS, "ca", 10).await.unwrap();
    let texts: Vec<_> = found.iter().filter_map(|suggestion| suggestion.text.as_deref()).collect();
    assert_eq!(texts, ["cat", "car"]);
    assert_eq!(found[0].counts, TagCounts::exact(3, 0));
}
