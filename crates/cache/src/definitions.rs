//! Tag text, as answered by whoever owns the tag dictionary.
//!
//! Nothing in the caches needs text; resolution and counting work on ids.
//! Text only matters when presenting suggestions and decomposing searches.

use crate::ids::TagId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

pub trait TagDefinitions: Send + Sync {
    fn text(&self, tag: TagId) -> Option<String>;

    fn tag_id(&self, text: &str) -> Option<TagId>;

    /// Tags whose text starts with `prefix` (ASCII case-insensitive).
    fn matching(&self, prefix: &str) -> Vec<TagId>;
}

#[derive(Debug, Default)]
struct Dictionary {
    by_id: HashMap<TagId, String>,
    by_text: BTreeMap<String, TagId>,
    next: i64,
}

/// Interning in-memory dictionary. Cloning shares the dictionary.
#[derive(Debug, Clone, Default)]
pub struct MemoryTagDefinitions {
    inner: Arc<RwLock<Dictionary>>,
}

impl MemoryTagDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the id for `text`, assigning the next free one if it's new.
    pub fn intern(&self, text: &str) -> TagId {
        let text = text.trim().to_lowercase();
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = guard.by_text.get(&text) {
            return *id;
        }
        guard.next += 1;
        let id = TagId(guard.next);
        guard.by_id.insert(id, text.clone());
        guard.by_text.insert(text, id);
        id
    }
}

impl TagDefinitions for MemoryTagDefinitions {
    fn text(&self, tag: TagId) -> Option<String> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.by_id.get(&tag).cloned()
    }

    fn tag_id(&self, text: &str) -> Option<TagId> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.by_text.get(&text.trim().to_lowercase()).copied()
    }

    fn matching(&self, prefix: &str) -> Vec<TagId> {
        let prefix = prefix.trim().to_lowercase();
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        // BTreeMap keeps texts sorted, so every match sits in one contiguous run.
        guard
            .by_text
            .range(prefix.clone()..)
            .take_while(|(text, _)| text.starts_with(&prefix))
            .map(|(_, id)| *id)
            .collect()
    }
}
