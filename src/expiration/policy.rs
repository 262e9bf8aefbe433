//! Expiration Policies
//!
//! Orderings over pages that decide which ones a sweep truncates first.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::paging::PageEntry;

/// Name of the least-recently-used policy
pub const LRU: &str = "LRU";

/// Name of the least-frequently-used policy
pub const LFU: &str = "LFU";

/// Total order over pages, first entry evicted first
pub trait ExpirationPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn compare(&self, a: &PageEntry, b: &PageEntry) -> Ordering;

    fn sort(&self, pages: &mut [PageEntry]) {
        pages.sort_by(|a, b| self.compare(a, b));
    }
}

/// Higher zoom first, then page key for a deterministic order
fn tie_break(a: &PageEntry, b: &PageEntry) -> Ordering {
    b.page
        .zoom_level()
        .cmp(&a.page.zoom_level())
        .then_with(|| a.page.key().cmp(&b.page.key()))
}

/// Least recently used pages first
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl ExpirationPolicy for LruPolicy {
    fn name(&self) -> &str {
        LRU
    }

    fn compare(&self, a: &PageEntry, b: &PageEntry) -> Ordering {
        a.stats
            .last_access_minutes()
            .cmp(&b.stats.last_access_minutes())
            .then_with(|| tie_break(a, b))
    }
}

/// Least frequently used pages first
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuPolicy;

impl ExpirationPolicy for LfuPolicy {
    fn name(&self) -> &str {
        LFU
    }

    fn compare(&self, a: &PageEntry, b: &PageEntry) -> Ordering {
        a.stats
            .frequency_of_use()
            .total_cmp(&b.stats.frequency_of_use())
            .then_with(|| tie_break(a, b))
    }
}

/// Policies by name
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Arc<dyn ExpirationPolicy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `LRU` and `LFU`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LruPolicy));
        registry.register(Arc::new(LfuPolicy));
        registry
    }

    /// Add `policy`, replacing any policy of the same name
    pub fn register(&mut self, policy: Arc<dyn ExpirationPolicy>) {
        self.policies.insert(policy.name().to_string(), policy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ExpirationPolicy>> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("expiration policy {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.policies.keys().cloned().collect()
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.names())
            .finish()
    }
}
