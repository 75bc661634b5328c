//! Handle registry
//!
//! Maps asset identities to their handles, wires consumer ownership to
//! reference counts and sweeps expired deferred releases.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::error::AssetError;
use super::handle::AssetHandle;
use super::key::AssetKey;
use super::owners::{ConsumerId, DestroyHook, Owners};
use crate::backend::{AssetBackend, Bundle};

/// Process-wide table of asset handles and consumer ownership.
///
/// Built once by [`AssetCache`](crate::core::AssetCache) and shared by
/// reference. Every method is synchronous and never holds an internal borrow
/// across a call into the backend, a handle or a user callback.
pub struct HandleRegistry<B: AssetBackend> {
    backend: Rc<B>,
    hold_window: Duration,
    /// Handles indexed by asset id
    handles: RefCell<FxHashMap<String, AssetHandle<B>>>,
    /// Consumer side-table
    owners: RefCell<Owners>,
}

impl<B: AssetBackend> HandleRegistry<B> {
    /// Create an empty registry
    #[must_use]
    pub fn new(backend: Rc<B>, hold_window: Duration) -> Self {
        Self {
            backend,
            hold_window,
            handles: RefCell::new(FxHashMap::default()),
            owners: RefCell::new(Owners::new()),
        }
    }

    /// The engine backend
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Grace period between a release and the native decrement
    #[must_use]
    pub fn hold_window(&self) -> Duration {
        self.hold_window
    }

    /// Get the handle for `key`, creating it on first use
    pub fn get_or_create(&self, key: &AssetKey) -> AssetHandle<B> {
        let mut handles = self.handles.borrow_mut();
        if let Some(handle) = handles.get(key.id()) {
            return handle.clone();
        }
        let handle = AssetHandle::new(key.clone(), Rc::clone(&self.backend), self.hold_window);
        handles.insert(key.id().to_string(), handle.clone());
        handle
    }

    /// Get an existing handle
    #[must_use]
    pub fn get(&self, key: &AssetKey) -> Option<AssetHandle<B>> {
        self.get_by_id(key.id())
    }

    /// Get an existing handle by its string id
    #[must_use]
    pub fn get_by_id(&self, id: &str) -> Option<AssetHandle<B>> {
        self.handles.borrow().get(id).cloned()
    }

    /// Snapshot of every handle
    #[must_use]
    pub fn handles(&self) -> Vec<AssetHandle<B>> {
        self.handles.borrow().values().cloned().collect()
    }

    /// Number of handles
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.borrow().len()
    }

    /// Check if no handle exists yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.borrow().is_empty()
    }

    /// Whether the asset's bundle is loaded and lists its path
    #[must_use]
    pub fn exists(&self, key: &AssetKey) -> bool {
        self.backend
            .get_bundle(key.bundle())
            .is_some_and(|bundle| bundle.has_asset(key.path()))
    }

    // -------------------------------------------------------------------------
    // Consumers
    // -------------------------------------------------------------------------

    /// Register a new consumer
    pub fn register_consumer(&self) -> ConsumerId {
        self.owners.borrow_mut().register()
    }

    /// Whether the consumer is still alive
    #[must_use]
    pub fn is_consumer_valid(&self, consumer: ConsumerId) -> bool {
        self.owners.borrow().is_alive(consumer)
    }

    /// Number of distinct assets the consumer holds
    #[must_use]
    pub fn owned_count(&self, consumer: ConsumerId) -> usize {
        self.owners.borrow().owned_count(consumer)
    }

    /// Whether the consumer holds the asset
    #[must_use]
    pub fn owns(&self, consumer: ConsumerId, key: &AssetKey) -> bool {
        self.owners.borrow().owns(consumer, key)
    }

    /// Number of live consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.owners.borrow().len()
    }

    /// Run `hook` when the consumer is destroyed, before its assets are
    /// released. Hooks run in registration order.
    ///
    /// Returns `false` if the consumer is already gone.
    pub fn on_consumer_destroyed(
        &self,
        consumer: ConsumerId,
        hook: impl FnOnce() + 'static,
    ) -> bool {
        let hook: DestroyHook = Box::new(hook);
        self.owners.borrow_mut().add_hook(consumer, hook)
    }

    /// Destroy a consumer now: run its hooks, then schedule one deferred
    /// release per distinct owned asset.
    ///
    /// Returns `false` if the consumer was already destroyed.
    pub fn destroy_consumer(&self, consumer: ConsumerId) -> bool {
        self.destroy_consumer_at(consumer, Instant::now())
    }

    /// [`destroy_consumer`](Self::destroy_consumer) with an explicit clock
    pub fn destroy_consumer_at(&self, consumer: ConsumerId, now: Instant) -> bool {
        let Some(teardown) = self.owners.borrow_mut().remove(consumer) else {
            return false;
        };

        for hook in teardown.hooks {
            hook();
        }
        for key in &teardown.owned {
            if let Some(handle) = self.get(key) {
                handle.defer_release(false, now);
            }
        }
        log::debug!(
            "Consumer {} destroyed, releasing {} asset(s)",
            consumer.raw(),
            teardown.owned.len()
        );
        true
    }

    /// Record that `consumer` owns the handle's asset.
    ///
    /// Only the first call per (consumer, asset) pair takes a hold; later calls
    /// are no-ops. Returns whether a hold was taken.
    pub fn record_ownership(&self, consumer: ConsumerId, handle: &AssetHandle<B>) -> bool {
        let first = self.owners.borrow_mut().record(consumer, handle.key());
        if first {
            handle.add_ref();
        }
        first
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Serve a request synchronously if the asset is already resident.
    ///
    /// On a hit, ownership is recorded and `callback` runs before returning.
    /// On a miss (or a destroyed consumer) the callback is handed back so the
    /// caller can issue a real load.
    pub fn try_serve_from_cache<F>(
        &self,
        key: &AssetKey,
        consumer: ConsumerId,
        callback: F,
    ) -> Result<(), F>
    where
        F: FnOnce(Option<B::Asset>),
    {
        if !self.is_consumer_valid(consumer) {
            return Err(callback);
        }
        let handle = self.get_or_create(key);
        let Some(asset) = handle.resident() else {
            return Err(callback);
        };

        self.record_ownership(consumer, &handle);
        callback(Some(asset));
        Ok(())
    }

    /// Load an asset for `consumer`.
    ///
    /// When the load completes and the consumer is still alive, ownership is
    /// recorded (on success) and `callback` receives the result. If the
    /// consumer was destroyed in the meantime the callback is dropped.
    pub fn load(
        self: &Rc<Self>,
        key: &AssetKey,
        consumer: ConsumerId,
        callback: impl FnOnce(Option<B::Asset>) + 'static,
    ) {
        self.load_then(key, consumer, callback, || {});
    }

    /// [`load`](Self::load), running `settled` once the request is finished
    /// whatever its outcome
    pub(crate) fn load_then(
        self: &Rc<Self>,
        key: &AssetKey,
        consumer: ConsumerId,
        callback: impl FnOnce(Option<B::Asset>) + 'static,
        settled: impl FnOnce() + 'static,
    ) {
        let handle = self.get_or_create(key);
        let registry: Weak<Self> = Rc::downgrade(self);
        let owner = handle.clone();

        handle.add_listener(move |asset| {
            match registry.upgrade() {
                Some(registry) if registry.is_consumer_valid(consumer) => {
                    if asset.is_some() {
                        registry.record_ownership(consumer, &owner);
                    }
                    callback(asset);
                }
                _ => {
                    let error = AssetError::ConsumerInvalidated {
                        id: owner.id().to_string(),
                    };
                    log::warn!("{error} (consumer {})", consumer.raw());
                }
            }
            settled();
        });
        handle.load();
    }

    // -------------------------------------------------------------------------
    // Releasing
    // -------------------------------------------------------------------------

    /// Schedule a deferred release of one hold, or of every hold with `clear`
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] if no handle exists for `key`
    pub fn release(&self, key: &AssetKey, clear: bool) -> Result<(), AssetError> {
        self.release_at(key, clear, Instant::now())
    }

    /// [`release`](Self::release) with an explicit clock
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] if no handle exists for `key`
    pub fn release_at(&self, key: &AssetKey, clear: bool, now: Instant) -> Result<(), AssetError> {
        let handle = self
            .get(key)
            .ok_or_else(|| AssetError::NotFound(key.id().to_string()))?;
        handle.defer_release(clear, now);
        Ok(())
    }

    /// Release every hold immediately, skipping the hold window
    ///
    /// # Errors
    ///
    /// Returns [`AssetError::NotFound`] if no handle exists for `key`
    pub fn release_immediate(&self, key: &AssetKey) -> Result<(), AssetError> {
        let handle = self
            .get(key)
            .ok_or_else(|| AssetError::NotFound(key.id().to_string()))?;
        handle.destroy_now();
        Ok(())
    }

    /// Sweep every handle, returning the number of holds released
    pub fn tick(&self, now: Instant) -> usize {
        self.handles().iter().map(|h| h.sweep(now)).sum()
    }
}

impl<B: AssetBackend> std::fmt::Debug for HandleRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("handles", &self.len())
            .field("consumers", &self.consumer_count())
            .field("hold_window", &self.hold_window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DEFAULT_BUNDLE, MemoryAsset, MemoryBackend, NativeAsset};
    use std::cell::Cell;

    const HOLD: Duration = Duration::from_secs(10);

    fn setup() -> (MemoryBackend, Rc<HandleRegistry<MemoryBackend>>) {
        let backend = MemoryBackend::new();
        backend.add_asset(DEFAULT_BUNDLE, "icon", "Texture", "pixels");
        backend.add_asset(DEFAULT_BUNDLE, "banner", "Texture", "wide");
        let registry = Rc::new(HandleRegistry::new(Rc::new(backend.clone()), HOLD));
        (backend, registry)
    }

    fn icon() -> AssetKey {
        AssetKey::new("resources", "icon", "Texture")
    }

    fn banner() -> AssetKey {
        AssetKey::new("resources", "banner", "Texture")
    }

    type Seen = Rc<RefCell<Vec<Option<MemoryAsset>>>>;

    fn capture() -> (Seen, impl FnOnce(Option<MemoryAsset>) + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let record = move |asset: Option<MemoryAsset>| sink.borrow_mut().push(asset);
        (seen, record)
    }

    #[test]
    fn test_get_or_create_returns_same_handle() {
        let (_backend, registry) = setup();
        let a = registry.get_or_create(&icon());
        let b = registry.get_or_create(&icon());

        assert!(a.ptr_eq(&b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_icon_texture_load_scenario() {
        let (backend, registry) = setup();
        let consumer = registry.register_consumer();
        let (first, cb1) = capture();
        let (second, cb2) = capture();

        registry.load(&icon(), consumer, cb1);
        registry.load(&icon(), consumer, cb2);

        let handle = registry.get(&icon()).unwrap();
        assert!(handle.is_loading());
        assert_eq!(backend.asset_loads(), 1);

        backend.pump();

        assert!(!handle.is_loading());
        let asset = handle.resident().unwrap();
        assert!(first.borrow()[0].as_ref().unwrap().ptr_eq(&asset));
        assert!(second.borrow()[0].as_ref().unwrap().ptr_eq(&asset));
    }

    #[test]
    fn test_same_consumer_takes_one_native_ref() {
        let (backend, registry) = setup();
        let consumer = registry.register_consumer();

        registry.load(&icon(), consumer, |_| {});
        backend.pump();
        registry.load(&icon(), consumer, |_| {});
        let served = registry.try_serve_from_cache(&icon(), consumer, |_| {});
        assert!(served.is_ok());

        let handle = registry.get(&icon()).unwrap();
        assert_eq!(handle.resident().unwrap().ref_count(), 1);
        assert_eq!(handle.dynamic_count(), 1);
        assert_eq!(registry.owned_count(consumer), 1);
    }

    #[test]
    fn test_two_consumers_take_two_native_refs() {
        let (backend, registry) = setup();
        let a = registry.register_consumer();
        let b = registry.register_consumer();

        registry.load(&icon(), a, |_| {});
        registry.load(&icon(), b, |_| {});
        backend.pump();

        let handle = registry.get(&icon()).unwrap();
        assert_eq!(handle.resident().unwrap().ref_count(), 2);
        assert_eq!(handle.dynamic_count(), 2);
    }

    #[test]
    fn test_try_serve_miss_hands_callback_back() {
        let (_backend, registry) = setup();
        let consumer = registry.register_consumer();

        let result = registry.try_serve_from_cache(&icon(), consumer, |_| {});

        assert!(result.is_err());
        assert_eq!(registry.owned_count(consumer), 0);
    }

    #[test]
    fn test_try_serve_hit_is_synchronous() {
        let (backend, registry) = setup();
        let loader = registry.register_consumer();
        registry.load(&icon(), loader, |_| {});
        backend.pump();

        let consumer = registry.register_consumer();
        let (seen, cb) = capture();
        let served = registry.try_serve_from_cache(&icon(), consumer, cb);
        assert!(served.is_ok());

        assert_eq!(seen.borrow().len(), 1);
        assert!(registry.owns(consumer, &icon()));
        assert_eq!(registry.owned_count(consumer), 1);
        assert_eq!(backend.asset_loads(), 1);
    }

    #[test]
    fn test_destroyed_consumer_callback_is_dropped() {
        let (backend, registry) = setup();
        let consumer = registry.register_consumer();
        let settled = Rc::new(Cell::new(false));
        let flag = Rc::clone(&settled);
        let (seen, cb) = capture();

        registry.load_then(&icon(), consumer, cb, move || flag.set(true));
        registry.destroy_consumer(consumer);
        backend.pump();

        assert!(seen.borrow().is_empty());
        assert!(settled.get());
        let handle = registry.get(&icon()).unwrap();
        assert_eq!(handle.dynamic_count(), 0);
        assert_eq!(handle.resident().unwrap().ref_count(), 0);
    }

    #[test]
    fn test_failed_load_delivers_none_without_ownership() {
        let (backend, registry) = setup();
        backend.fail_asset("icon", "Texture");
        let consumer = registry.register_consumer();
        let (seen, cb) = capture();

        registry.load(&icon(), consumer, cb);
        backend.pump();

        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].is_none());
        assert_eq!(registry.owned_count(consumer), 0);
        assert_eq!(registry.get(&icon()).unwrap().dynamic_count(), 0);
    }

    #[test]
    fn test_destroy_consumer_defers_one_release_per_asset() {
        let (backend, registry) = setup();
        let consumer = registry.register_consumer();
        registry.load(&icon(), consumer, |_| {});
        registry.load(&banner(), consumer, |_| {});
        backend.pump();
        registry.load(&icon(), consumer, |_| {});

        let t0 = Instant::now();
        assert!(registry.destroy_consumer_at(consumer, t0));
        assert!(!registry.destroy_consumer_at(consumer, t0));

        for key in [icon(), banner()] {
            let handle = registry.get(&key).unwrap();
            assert_eq!(handle.dynamic_count(), 0);
            assert_eq!(handle.pending_releases(), 1);
            assert_eq!(handle.resident().unwrap().ref_count(), 1);
        }

        assert_eq!(registry.tick(t0 + Duration::from_secs(11)), 2);
        assert!(!registry.get(&icon()).unwrap().is_resident());
        assert!(!registry.get(&banner()).unwrap().is_resident());
    }

    #[test]
    fn test_destroy_hooks_run_in_order_before_release() {
        let (backend, registry) = setup();
        let consumer = registry.register_consumer();
        registry.load(&icon(), consumer, |_| {});
        backend.pump();

        let order = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second"] {
            let order = Rc::clone(&order);
            let weak = Rc::downgrade(&registry);
            registry.on_consumer_destroyed(consumer, move || {
                let held = weak
                    .upgrade()
                    .and_then(|r| r.get(&icon()))
                    .map_or(0, |h| h.dynamic_count());
                order.borrow_mut().push((name, held));
            });
        }

        registry.destroy_consumer(consumer);

        assert_eq!(*order.borrow(), vec![("first", 1), ("second", 1)]);
        assert!(!registry.on_consumer_destroyed(consumer, || {}));
    }

    #[test]
    fn test_release_unknown_is_not_found() {
        let (_backend, registry) = setup();
        let key = AssetKey::new("resources", "nothing", "Texture");

        assert_eq!(
            registry.release(&key, false),
            Err(AssetError::NotFound(key.id().to_string()))
        );
        assert!(registry.release_immediate(&key).is_err());
    }

    #[test]
    fn test_release_immediate_drops_asset() {
        let (backend, registry) = setup();
        let consumer = registry.register_consumer();
        registry.load(&icon(), consumer, |_| {});
        backend.pump();

        assert!(registry.release_immediate(&icon()).is_ok());

        let handle = registry.get(&icon()).unwrap();
        assert!(!handle.is_resident());
        let resident = backend.resident(DEFAULT_BUNDLE, "icon", "Texture");
        assert!(resident.is_none());
    }

    #[test]
    fn test_tick_is_idempotent() {
        let (backend, registry) = setup();
        let consumer = registry.register_consumer();
        registry.load(&icon(), consumer, |_| {});
        backend.pump();
        let asset = registry.get(&icon()).unwrap().resident().unwrap();
        asset.add_ref();

        let t0 = Instant::now();
        registry.release_at(&icon(), false, t0).unwrap();
        let later = t0 + Duration::from_secs(11);

        assert_eq!(registry.tick(later), 1);
        assert_eq!(registry.tick(later), 0);
        assert_eq!(asset.ref_count(), 1);
    }

    #[test]
    fn test_exists_checks_bundle_listing() {
        let (backend, registry) = setup();
        backend.add_bundle("levels", false);
        backend.add_asset("levels", "one", "Scene", "");

        assert!(registry.exists(&icon()));
        assert!(!registry.exists(&AssetKey::new("resources", "nothing", "Texture")));
        // Not loaded yet
        assert!(!registry.exists(&AssetKey::new("levels", "one", "Scene")));
    }
}
