//! Asset handle implementation
//!
//! One handle exists per asset identity. It owns the dynamic reference count,
//! the queue of deferred releases and the listeners waiting on an in-flight
//! load. The backing engine asset may be released and reloaded many times
//! while the handle itself stays put.

use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use super::error::AssetError;
use super::key::AssetKey;
use crate::backend::{self, AssetBackend, Bundle, LoadCallback, NativeAsset};

/// Callback receiving a load result; `None` means the load failed
type Listener<A> = Box<dyn FnOnce(Option<A>)>;

/// Mutable bookkeeping behind a handle
struct HandleState<A> {
    /// Logical holds not yet scheduled for release
    dynamic_count: u32,
    /// Due times of holds scheduled for release
    pending_releases: SmallVec<[Instant; 4]>,
    /// Native increments requested while the asset was not resident
    deferred_refs: u32,
    /// Whether a load is in flight
    loading: bool,
    /// When the in-flight load started
    load_started: Option<Instant>,
    /// Callbacks waiting for the in-flight load
    listeners: SmallVec<[Listener<A>; 2]>,
}

impl<A> Default for HandleState<A> {
    fn default() -> Self {
        Self {
            dynamic_count: 0,
            pending_releases: SmallVec::new(),
            deferred_refs: 0,
            loading: false,
            load_started: None,
            listeners: SmallVec::new(),
        }
    }
}

struct HandleInner<B: AssetBackend> {
    key: AssetKey,
    backend: Rc<B>,
    hold_window: Duration,
    state: RefCell<HandleState<B::Asset>>,
}

/// Shared handle to one cached asset identity.
///
/// Cloning is cheap and yields the same handle. No borrow of the internal state
/// is held while calling into the backend or a listener, so completions may
/// arrive synchronously and listeners may call back into the handle.
pub struct AssetHandle<B: AssetBackend> {
    inner: Rc<HandleInner<B>>,
}

impl<B: AssetBackend> AssetHandle<B> {
    /// Create a handle for `key` with nothing loaded and no holds
    #[must_use]
    pub fn new(key: AssetKey, backend: Rc<B>, hold_window: Duration) -> Self {
        Self {
            inner: Rc::new(HandleInner {
                key,
                backend,
                hold_window,
                state: RefCell::new(HandleState::default()),
            }),
        }
    }

    /// Identity of this handle
    #[must_use]
    pub fn key(&self) -> &AssetKey {
        &self.inner.key
    }

    /// Unique string id of this handle
    #[must_use]
    pub fn id(&self) -> &str {
        self.inner.key.id()
    }

    /// The backing engine asset, if it is currently resident and valid
    #[must_use]
    pub fn resident(&self) -> Option<B::Asset> {
        let key = &self.inner.key;
        self.inner
            .backend
            .get_bundle(key.bundle())?
            .get(key.path(), key.type_tag())
            .filter(|asset| asset.is_valid())
    }

    /// Whether the backing asset is resident
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.resident().is_some()
    }

    /// Logical holds not yet scheduled for release
    #[must_use]
    pub fn dynamic_count(&self) -> u32 {
        self.inner.state.borrow().dynamic_count
    }

    /// Number of holds waiting out the hold window
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.inner.state.borrow().pending_releases.len()
    }

    /// Native increments waiting for the asset to become resident
    #[must_use]
    pub fn deferred_refs(&self) -> u32 {
        self.inner.state.borrow().deferred_refs
    }

    /// Whether a load is in flight
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    /// Whether two handles are the same entry
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take one logical hold on the asset.
    ///
    /// The native count is bumped right away when the asset is resident,
    /// otherwise once the next load succeeds.
    pub fn add_ref(&self) {
        match self.resident() {
            Some(asset) => {
                self.apply_deferred_refs(&asset);
                asset.add_ref();
            }
            None => self.inner.state.borrow_mut().deferred_refs += 1,
        }
        self.inner.state.borrow_mut().dynamic_count += 1;
    }

    /// Schedule one hold (or, with `clear`, every hold) for release once the
    /// hold window has passed. Does nothing when no hold is outstanding.
    pub fn defer_release(&self, clear: bool, now: Instant) {
        let mut state = self.inner.state.borrow_mut();
        if state.dynamic_count == 0 {
            return;
        }

        let due = now + self.inner.hold_window;
        let released = if clear { state.dynamic_count } else { 1 };
        for _ in 0..released {
            state.pending_releases.push(due);
        }
        state.dynamic_count -= released;
    }

    /// Turn every pending release due at or before `now` into a native
    /// decrement followed by a release attempt.
    ///
    /// Returns the number of holds released. Calling again with the same or an
    /// earlier `now` releases nothing.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = {
            let mut state = self.inner.state.borrow_mut();
            let before = state.pending_releases.len();
            state.pending_releases.retain(|due| *due > now);
            before - state.pending_releases.len()
        };

        if expired > 0 {
            log::trace!("Sweeping {expired} expired hold(s) on '{}'", self.id());
        }
        for _ in 0..expired {
            self.native_dec();
            self.release_attempt();
        }
        expired
    }

    /// Reset idle bookkeeping and drop the backing asset from its bundle once
    /// nothing references it natively. The handle itself stays usable.
    ///
    /// The dynamic count is only zeroed once the native count is zero, so a
    /// hold taken by another consumer survives an idle reset.
    pub fn release_attempt(&self) {
        let Some(asset) = self.resident() else {
            return;
        };
        let unreferenced = asset.ref_count() == 0;

        let stale_listeners = {
            let mut state = self.inner.state.borrow_mut();
            if state.pending_releases.is_empty() {
                state.loading = false;
                state.load_started = None;
                if unreferenced {
                    state.dynamic_count = 0;
                }
                std::mem::take(&mut state.listeners)
            } else {
                SmallVec::new()
            }
        };
        drop(stale_listeners);

        if !unreferenced {
            return;
        }
        let key = &self.inner.key;
        if let Some(bundle) = self.inner.backend.get_bundle(key.bundle()) {
            bundle.release(key.path());
            log::info!("Released asset '{}'", self.id());
        }
    }

    /// Release every hold right now, skipping the hold window.
    ///
    /// Pending releases get their native decrement here too, since the sweep
    /// that would have issued it never runs for them.
    pub fn destroy_now(&self) {
        let drained = {
            let mut state = self.inner.state.borrow_mut();
            let drained = state.dynamic_count as usize + state.pending_releases.len();
            state.dynamic_count = 0;
            state.pending_releases.clear();
            drained
        };

        for _ in 0..drained {
            self.native_dec();
        }
        self.release_attempt();
    }

    /// Start loading the backing asset.
    ///
    /// Does nothing if the asset is resident or a load is already in flight.
    /// Every queued listener receives the result exactly once.
    pub fn load(&self) {
        if self.is_resident() {
            return;
        }
        {
            let mut state = self.inner.state.borrow_mut();
            if state.loading {
                return;
            }
            state.loading = true;
            state.load_started = Some(Instant::now());
        }
        log::debug!("Loading '{}'", self.id());

        let handle = self.clone();
        let backend = &*self.inner.backend;
        backend::resolve_bundle(backend, self.inner.key.bundle(), move |bundle| {
            let Some(bundle) = bundle else {
                let bundle = handle.key().bundle().to_string();
                handle.finish_load(Err(AssetError::BundleResolution { bundle }));
                return;
            };

            let completion = handle.clone();
            let on_loaded: LoadCallback<B::Asset> = Box::new(move |result| {
                let result = result.map_err(|source| AssetError::AssetLoad {
                    id: completion.id().to_string(),
                    source,
                });
                completion.finish_load(result);
            });
            let key = handle.key();
            bundle.load_typed(key.path(), key.type_tag(), on_loaded);
        });
    }

    /// Call `listener` with the resident asset now, or with the result of the
    /// next load completion.
    pub fn add_listener(&self, listener: impl FnOnce(Option<B::Asset>) + 'static) {
        match self.resident() {
            Some(asset) => listener(Some(asset)),
            None => {
                let mut state = self.inner.state.borrow_mut();
                state.listeners.push(Box::new(listener));
            }
        }
    }

    fn finish_load(&self, result: Result<B::Asset, AssetError>) {
        let (listeners, started) = {
            let mut state = self.inner.state.borrow_mut();
            state.loading = false;
            let listeners = std::mem::take(&mut state.listeners);
            (listeners, state.load_started.take())
        };

        if let Some(started) = started {
            log::debug!(
                "Finished '{}' in {:.2}ms",
                self.id(),
                started.elapsed().as_secs_f64() * 1000.0
            );
        }

        match result {
            Ok(asset) => {
                self.apply_deferred_refs(&asset);
                for listener in listeners {
                    listener(Some(asset.clone()));
                }
            }
            Err(e) => {
                log::warn!("{e}");
                for listener in listeners {
                    listener(None);
                }
            }
        }
    }

    fn apply_deferred_refs(&self, asset: &B::Asset) {
        let deferred = std::mem::take(&mut self.inner.state.borrow_mut().deferred_refs);
        for _ in 0..deferred {
            asset.add_ref();
        }
    }

    /// One native decrement, or cancel a deferred increment if not resident
    fn native_dec(&self) {
        if let Some(asset) = self.resident() {
            asset.dec_ref();
            return;
        }
        let mut state = self.inner.state.borrow_mut();
        state.deferred_refs = state.deferred_refs.saturating_sub(1);
    }
}

impl<B: AssetBackend> Clone for AssetHandle<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: AssetBackend> PartialEq for AssetHandle<B> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl<B: AssetBackend> Eq for AssetHandle<B> {}

impl<B: AssetBackend> Hash for AssetHandle<B> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl<B: AssetBackend> std::fmt::Debug for AssetHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("AssetHandle")
            .field("id", &self.id())
            .field("dynamic_count", &state.dynamic_count)
            .field("pending_releases", &state.pending_releases.len())
            .field("loading", &state.loading)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DEFAULT_BUNDLE, MemoryAsset, MemoryBackend};
    use std::cell::RefCell;

    const HOLD: Duration = Duration::from_secs(10);

    fn setup() -> (MemoryBackend, AssetHandle<MemoryBackend>) {
        let backend = MemoryBackend::new();
        backend.add_asset(DEFAULT_BUNDLE, "icon", "Texture", "pixels");
        let key = AssetKey::new(DEFAULT_BUNDLE, "icon", "Texture");
        let handle = AssetHandle::new(key, Rc::new(backend.clone()), HOLD);
        (backend, handle)
    }

    fn loaded() -> (MemoryBackend, AssetHandle<MemoryBackend>, MemoryAsset) {
        let (backend, handle) = setup();
        handle.load();
        backend.pump();
        let asset = handle.resident().unwrap();
        (backend, handle, asset)
    }

    fn recorder() -> (Rc<RefCell<Vec<Option<String>>>>, impl Fn() -> Listener<MemoryAsset>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let make = move || -> Listener<MemoryAsset> {
            let sink = Rc::clone(&sink);
            Box::new(move |asset: Option<MemoryAsset>| {
                let payload = asset.map(|a| a.payload().to_string());
                sink.borrow_mut().push(payload);
            })
        };
        (seen, make)
    }

    #[test]
    fn test_load_fans_out_to_every_listener() {
        let (backend, handle) = setup();
        let (seen, listener) = recorder();

        handle.add_listener(listener());
        handle.add_listener(listener());
        handle.load();

        assert!(handle.is_loading());
        assert_eq!(backend.asset_loads(), 1);
        assert!(seen.borrow().is_empty());

        backend.pump();

        assert!(!handle.is_loading());
        assert_eq!(*seen.borrow(), vec![Some("pixels".to_string()); 2]);
    }

    #[test]
    fn test_load_in_flight_is_not_reissued() {
        let (backend, handle) = setup();
        handle.load();
        handle.load();
        backend.pump();
        handle.load();

        assert_eq!(backend.asset_loads(), 1);
        assert!(handle.is_resident());
    }

    #[test]
    fn test_listener_on_resident_asset_runs_immediately() {
        let (_backend, handle, _asset) = loaded();
        let (seen, listener) = recorder();

        handle.add_listener(listener());

        assert_eq!(*seen.borrow(), vec![Some("pixels".to_string())]);
    }

    #[test]
    fn test_dynamic_count_never_negative() {
        let (_backend, handle, _asset) = loaded();
        let now = Instant::now();

        handle.defer_release(false, now);
        assert_eq!(handle.dynamic_count(), 0);
        assert_eq!(handle.pending_releases(), 0);

        handle.add_ref();
        handle.defer_release(false, now);
        handle.defer_release(false, now);
        handle.defer_release(true, now);

        assert_eq!(handle.dynamic_count(), 0);
        assert_eq!(handle.pending_releases(), 1);
    }

    #[test]
    fn test_defer_release_clear_flushes_all_holds() {
        let (_backend, handle, asset) = loaded();
        for _ in 0..3 {
            handle.add_ref();
        }

        handle.defer_release(true, Instant::now());

        assert_eq!(handle.dynamic_count(), 0);
        assert_eq!(handle.pending_releases(), 3);
        assert_eq!(asset.ref_count(), 3);
    }

    #[test]
    fn test_sweep_removes_only_expired_entries() {
        let (_backend, handle, asset) = loaded();
        let t0 = Instant::now();
        handle.add_ref();
        handle.add_ref();
        handle.defer_release(false, t0);
        handle.defer_release(false, t0 + Duration::from_secs(5));

        assert_eq!(handle.sweep(t0 + Duration::from_secs(9)), 0);
        assert_eq!(handle.sweep(t0 + HOLD), 1);
        assert_eq!(handle.pending_releases(), 1);
        assert_eq!(asset.ref_count(), 1);

        // Same timestamp again must not double-release
        assert_eq!(handle.sweep(t0 + HOLD), 0);
        assert_eq!(asset.ref_count(), 1);
    }

    #[test]
    fn test_sweep_after_hold_window_releases_backing_asset() {
        let (backend, handle, asset) = loaded();
        let t0 = Instant::now();
        handle.add_ref();
        handle.defer_release(false, t0);
        assert_eq!(asset.ref_count(), 1);

        assert_eq!(handle.sweep(t0 + Duration::from_secs(11)), 1);

        assert_eq!(asset.ref_count(), 0);
        assert!(!handle.is_resident());
        assert!(!asset.is_valid());

        // The entry survives and can load again
        handle.load();
        backend.pump();
        assert!(handle.is_resident());
        assert_eq!(backend.asset_loads(), 2);
    }

    #[test]
    fn test_static_refs_keep_asset_resident() {
        let (_backend, handle, asset) = loaded();
        asset.add_ref();
        let t0 = Instant::now();
        handle.add_ref();
        handle.defer_release(false, t0);

        handle.sweep(t0 + HOLD);

        assert_eq!(asset.ref_count(), 1);
        assert!(handle.is_resident());
    }

    #[test]
    fn test_add_ref_before_load_is_applied_on_completion() {
        let (backend, handle) = setup();

        handle.add_ref();
        assert_eq!(handle.deferred_refs(), 1);
        assert_eq!(handle.dynamic_count(), 1);

        handle.load();
        backend.pump();

        let asset = handle.resident().unwrap();
        assert_eq!(asset.ref_count(), 1);
        assert_eq!(handle.deferred_refs(), 0);
    }

    #[test]
    fn test_load_failure_fans_out_none() {
        let (backend, handle) = setup();
        backend.fail_asset("icon", "Texture");
        let (seen, listener) = recorder();

        handle.add_listener(listener());
        handle.add_listener(listener());
        handle.load();
        backend.pump();

        assert_eq!(*seen.borrow(), vec![None, None]);
        assert!(!handle.is_loading());
        assert!(!handle.is_resident());
    }

    #[test]
    fn test_unknown_bundle_fans_out_none() {
        let backend = MemoryBackend::new();
        let key = AssetKey::new("missing", "icon", "Texture");
        let handle = AssetHandle::new(key, Rc::new(backend.clone()), HOLD);
        let (seen, listener) = recorder();

        handle.add_listener(listener());
        handle.load();
        backend.pump_all();

        assert_eq!(*seen.borrow(), vec![None]);
        assert!(!handle.is_loading());
    }

    #[test]
    fn test_destroy_now_drains_holds_and_pending() {
        let (_backend, handle, asset) = loaded();
        handle.add_ref();
        handle.add_ref();
        handle.defer_release(false, Instant::now());

        handle.destroy_now();

        assert_eq!(handle.dynamic_count(), 0);
        assert_eq!(handle.pending_releases(), 0);
        assert_eq!(asset.ref_count(), 0);
        assert!(!handle.is_resident());
    }

    #[test]
    fn test_handles_compare_by_identity() {
        let (_backend, handle) = setup();
        let copy = handle.clone();
        assert_eq!(handle, copy);
        assert!(handle.ptr_eq(&copy));
    }
}
