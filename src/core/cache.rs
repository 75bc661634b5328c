//! Asset cache facade and scheduler glue

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use crate::assets::{AssetError, AssetKey, ConsumerId, HandleRegistry, LoadCoordinator};
use crate::backend::AssetBackend;
use crate::core::{CacheConfig, CacheStats};

/// Entry point for games: one per process, constructed at startup and passed
/// by reference to whatever needs assets.
///
/// The host calls [`update`](Self::update) once per frame. Each call dispatches
/// at most one queued load, and every `sweep_interval` it turns expired
/// deferred releases into real ones.
pub struct AssetCache<B: AssetBackend> {
    config: CacheConfig,
    registry: Rc<HandleRegistry<B>>,
    coordinator: LoadCoordinator<B>,
    /// When the next sweep is due; set on the first update
    next_sweep: Cell<Option<Instant>>,
    released_total: Cell<u64>,
}

impl<B: AssetBackend> AssetCache<B> {
    /// Create a cache in front of `backend`
    #[must_use]
    pub fn new(backend: B, config: CacheConfig) -> Self {
        let registry = Rc::new(HandleRegistry::new(Rc::new(backend), config.hold_window()));
        let coordinator = LoadCoordinator::new(Rc::clone(&registry));
        if config.start_paused {
            coordinator.pause();
        }
        Self {
            config,
            registry,
            coordinator,
            next_sweep: Cell::new(None),
            released_total: Cell::new(0),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The handle registry
    #[must_use]
    pub fn registry(&self) -> &Rc<HandleRegistry<B>> {
        &self.registry
    }

    /// The load queue
    #[must_use]
    pub fn coordinator(&self) -> &LoadCoordinator<B> {
        &self.coordinator
    }

    /// The engine backend
    #[must_use]
    pub fn backend(&self) -> &B {
        self.registry.backend()
    }

    // -------------------------------------------------------------------------
    // Consumers
    // -------------------------------------------------------------------------

    /// Register a consumer that will own the assets it requests
    pub fn register_consumer(&self) -> ConsumerId {
        self.registry.register_consumer()
    }

    /// Whether the consumer is still alive
    #[must_use]
    pub fn is_consumer_valid(&self, consumer: ConsumerId) -> bool {
        self.registry.is_consumer_valid(consumer)
    }

    /// Run `hook` when the consumer is destroyed, before its assets are released
    pub fn on_consumer_destroyed(
        &self,
        consumer: ConsumerId,
        hook: impl FnOnce() + 'static,
    ) -> bool {
        self.registry.on_consumer_destroyed(consumer, hook)
    }

    /// Notify the cache that a consumer was destroyed.
    ///
    /// Pending requests for it are dropped and every asset it owned gets one
    /// deferred release.
    pub fn destroy_consumer(&self, consumer: ConsumerId) -> bool {
        self.registry.destroy_consumer(consumer)
    }

    /// [`destroy_consumer`](Self::destroy_consumer) with an explicit clock
    pub fn destroy_consumer_at(&self, consumer: ConsumerId, now: Instant) -> bool {
        self.registry.destroy_consumer_at(consumer, now)
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Load an asset now, in parallel with any other load.
    ///
    /// `callback` runs synchronously on a cache hit, otherwise when the load
    /// completes. It receives `None` if the load failed and is dropped if the
    /// consumer is destroyed first.
    pub fn request(
        &self,
        key: &AssetKey,
        consumer: ConsumerId,
        callback: impl FnOnce(Option<B::Asset>) + 'static,
    ) {
        self.registry.load(key, consumer, callback);
    }

    /// Load an asset through the serialized queue.
    ///
    /// Cache hits are served synchronously; returns `true` in that case.
    pub fn request_queued(
        &self,
        key: &AssetKey,
        consumer: ConsumerId,
        callback: impl FnOnce(Option<B::Asset>) + 'static,
    ) -> bool {
        self.coordinator
            .enqueue_or_serve(key.clone(), consumer, callback)
    }

    /// [`request`](Self::request) addressed by a `bundle://path` URI
    pub fn request_uri(
        &self,
        uri: &str,
        type_tag: &str,
        consumer: ConsumerId,
        callback: impl FnOnce(Option<B::Asset>) + 'static,
    ) {
        self.request(&AssetKey::from_uri(uri, type_tag), consumer, callback);
    }

    /// [`request_queued`](Self::request_queued) addressed by a `bundle://path` URI
    pub fn request_queued_uri(
        &self,
        uri: &str,
        type_tag: &str,
        consumer: ConsumerId,
        callback: impl FnOnce(Option<B::Asset>) + 'static,
    ) -> bool {
        self.request_queued(&AssetKey::from_uri(uri, type_tag), consumer, callback)
    }

    /// Whether the asset's bundle is loaded and lists it
    #[must_use]
    pub fn exists(&self, key: &AssetKey) -> bool {
        self.registry.exists(key)
    }

    // -------------------------------------------------------------------------
    // Releasing
    // -------------------------------------------------------------------------

    /// Release one hold (or every hold with `clear`) after the hold window
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] if the asset was never requested
    pub fn release(&self, key: &AssetKey, clear: bool) -> Result<(), AssetError> {
        self.registry.release(key, clear)
    }

    /// [`release`](Self::release) addressed by a `bundle://path` URI
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] if the asset was never requested
    pub fn release_uri(&self, uri: &str, type_tag: &str, clear: bool) -> Result<(), AssetError> {
        self.release(&AssetKey::from_uri(uri, type_tag), clear)
    }

    /// Release every hold right now
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] if the asset was never requested
    pub fn release_immediate(&self, key: &AssetKey) -> Result<(), AssetError> {
        self.registry.release_immediate(key)
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Per-frame tick: dispatch the next queued load and, when due, sweep
    /// expired releases. Returns the number of holds released.
    pub fn update(&self, now: Instant) -> usize {
        self.coordinator.drain();

        let interval = self.config.sweep_interval();
        let Some(due) = self.next_sweep.get() else {
            self.next_sweep.set(Some(now + interval));
            return 0;
        };
        if now < due {
            return 0;
        }

        self.next_sweep.set(Some(now + interval));
        let released = self.registry.tick(now);
        if released > 0 {
            let total = &self.released_total;
            total.set(total.get() + released as u64);
            log::debug!("Sweep released {released} hold(s)");
        }
        released
    }

    /// Snapshot of the cache's bookkeeping
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            queued: self.coordinator.len(),
            consumers: self.registry.consumer_count(),
            released_total: self.released_total.get(),
            ..CacheStats::default()
        };
        for handle in self.registry.handles() {
            stats.handles += 1;
            stats.resident += usize::from(handle.is_resident());
            stats.loading += usize::from(handle.is_loading());
            stats.dynamic_refs += u64::from(handle.dynamic_count());
            stats.pending_releases += handle.pending_releases();
        }
        stats
    }
}

impl<B: AssetBackend> std::fmt::Debug for AssetCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
