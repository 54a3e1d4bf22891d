//! File-domain membership, as answered by whoever owns file storage.
//!
//! The cache never decides which files belong to which domain; it asks. The
//! engine calls [`group_by_domain`](FileDomainMembership::group_by_domain)
//! once per mapping change so the per-domain fan-out works from a
//! precomputed filter instead of testing membership per hash, per domain.

use crate::ids::{FileServiceId, HashId};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Failure reported by a membership collaborator.
pub type MembershipError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[async_trait]
pub trait FileDomainMembership: Send + Sync {
    /// Every file currently in `domain`.
    async fn current_hash_ids(&self, domain: FileServiceId) -> Result<BTreeSet<HashId>, MembershipError>;

    /// Split `hashes` by the real file domains each one belongs to. Domains
    /// with no matching hashes may be omitted.
    ///
    /// The default implementation asks [`contains`](Self::contains) for every
    /// (domain, hash) pair; implementations backed by an index should override
    /// it.
    async fn group_by_domain(
        &self,
        domains: &[FileServiceId],
        hashes: &BTreeSet<HashId>,
    ) -> Result<BTreeMap<FileServiceId, BTreeSet<HashId>>, MembershipError> {
        let mut grouped = BTreeMap::new();
        for domain in domains {
            let mut subset = BTreeSet::new();
            for hash in hashes {
                if self.contains(*domain, *hash).await? {
                    subset.insert(*hash);
                }
            }
            if !subset.is_empty() {
                grouped.insert(*domain, subset);
            }
        }
        Ok(grouped)
    }

    async fn contains(&self, domain: FileServiceId, hash: HashId) -> Result<bool, MembershipError>;
}

/// In-memory membership, for tests and for embedding callers that already
/// keep domain membership in memory.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryMembership {
    domains: Arc<RwLock<HashMap<FileServiceId, BTreeSet<HashId>>>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, domain: FileServiceId, hashes: impl IntoIterator<Item = HashId>) {
        let mut guard = self.domains.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.entry(domain).or_default().extend(hashes);
    }

    pub fn remove(&self, domain: FileServiceId, hashes: impl IntoIterator<Item = HashId>) {
        let mut guard = self.domains.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(members) = guard.get_mut(&domain) {
            for hash in hashes {
                members.remove(&hash);
            }
        }
    }

    fn snapshot(&self, domain: FileServiceId) -> BTreeSet<HashId> {
        let guard = self.domains.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(&domain).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl FileDomainMembership for MemoryMembership {
    async fn current_hash_ids(&self, domain: FileServiceId) -> Result<BTreeSet<HashId>, MembershipError> {
        Ok(self.snapshot(domain))
    }

    async fn group_by_domain(
        &self,
        domains: &[FileServiceId],
        hashes: &BTreeSet<HashId>,
    ) -> Result<BTreeMap<FileServiceId, BTreeSet<HashId>>, MembershipError> {
        let guard = self.domains.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut grouped = BTreeMap::new();
        for domain in domains {
            let Some(members) = guard.get(domain) else {
                continue;
            };
            let subset: BTreeSet<HashId> = hashes.intersection(members).copied().collect();
            if !subset.is_empty() {
                grouped.insert(*domain, subset);
            }
        }
        Ok(grouped)
    }

    async fn contains(&self, domain: FileServiceId, hash: HashId) -> Result<bool, MembershipError> {
        let guard = self.domains.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(&domain).is_some_and(|members| members.contains(&hash)))
    }
}
