//! Consumer ownership side-table
//!
//! Tracks which assets each consumer acquired and what should run when the
//! consumer is destroyed. Consumers never carry cache state themselves; they
//! are known to the cache only by their [`ConsumerId`].

use rustc_hash::{FxHashMap, FxHashSet};

use super::key::AssetKey;

/// Identifier of a consumer registered with the cache.
///
/// Ids are never reused, so a stale id simply reports as destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    /// Get the raw id value.
    #[must_use]
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Action run when a consumer is destroyed
pub(crate) type DestroyHook = Box<dyn FnOnce()>;

#[derive(Default)]
struct ConsumerEntry {
    /// Owned asset keys, in acquisition order
    owned: Vec<AssetKey>,
    /// Ids of `owned`, for the one-hold-per-consumer check
    owned_ids: FxHashSet<String>,
    /// Destruction hooks, in registration order
    hooks: Vec<DestroyHook>,
}

/// Everything a destroyed consumer leaves behind
pub(crate) struct Teardown {
    /// Hooks to run, oldest first
    pub(crate) hooks: Vec<DestroyHook>,
    /// Assets to release, one hold each
    pub(crate) owned: Vec<AssetKey>,
}

/// Registry-owned mapping from consumer to owned assets and hooks.
#[derive(Default)]
pub(crate) struct Owners {
    next_id: u64,
    consumers: FxHashMap<ConsumerId, ConsumerEntry>,
}

impl Owners {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new live consumer
    pub fn register(&mut self) -> ConsumerId {
        self.next_id += 1;
        let id = ConsumerId(self.next_id);
        self.consumers.insert(id, ConsumerEntry::default());
        id
    }

    /// Whether the consumer is registered and not yet destroyed
    #[must_use]
    pub fn is_alive(&self, id: ConsumerId) -> bool {
        self.consumers.contains_key(&id)
    }

    /// Record that `id` owns `key`.
    ///
    /// Returns `true` only the first time a live consumer acquires the key;
    /// that is when the caller should take a hold on the asset.
    pub fn record(&mut self, id: ConsumerId, key: &AssetKey) -> bool {
        let Some(entry) = self.consumers.get_mut(&id) else {
            return false;
        };
        if !entry.owned_ids.insert(key.id().to_string()) {
            return false;
        }
        entry.owned.push(key.clone());
        true
    }

    /// Whether `id` currently owns `key`
    #[must_use]
    pub fn owns(&self, id: ConsumerId, key: &AssetKey) -> bool {
        self.consumers
            .get(&id)
            .is_some_and(|entry| entry.owned_ids.contains(key.id()))
    }

    /// Number of distinct assets owned by `id`
    #[must_use]
    pub fn owned_count(&self, id: ConsumerId) -> usize {
        self.consumers.get(&id).map_or(0, |entry| entry.owned.len())
    }

    /// Append a destruction hook. Returns `false` if the consumer is gone.
    pub fn add_hook(&mut self, id: ConsumerId, hook: DestroyHook) -> bool {
        match self.consumers.get_mut(&id) {
            Some(entry) => {
                entry.hooks.push(hook);
                true
            }
            None => false,
        }
    }

    /// Forget a consumer, handing back what must run for its destruction.
    ///
    /// Returns `None` if the consumer was already destroyed, so teardown
    /// happens at most once.
    pub fn remove(&mut self, id: ConsumerId) -> Option<Teardown> {
        self.consumers.remove(&id).map(|entry| Teardown {
            hooks: entry.hooks,
            owned: entry.owned,
        })
    }

    /// Number of live consumers
    #[must_use]
    pub fn len(&self) -> usize {
        self.consumers.len()
    }
}
