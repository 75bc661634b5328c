//! In-memory engine backend
//!
//! Simulates an engine's bundle system: bundles must be loaded before their
//! assets can be, loads complete on a later `pump()` (one frame of I/O), and
//! every resident asset carries a native reference count. Used by the tests
//! and the demo binary.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    AssetBackend, BackendError, Bundle, BundleCallback, DEFAULT_BUNDLE, LoadCallback, NativeAsset,
};

/// Deferred completion
type Job = Box<dyn FnOnce()>;

#[derive(Debug)]
struct AssetCell {
    path: String,
    type_tag: String,
    payload: String,
    refs: Cell<u32>,
    valid: Cell<bool>,
}

/// A resident asset owned by [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryAsset {
    inner: Rc<AssetCell>,
}

impl MemoryAsset {
    fn new(path: &str, type_tag: &str, payload: &str) -> Self {
        Self {
            inner: Rc::new(AssetCell {
                path: path.to_string(),
                type_tag: type_tag.to_string(),
                payload: payload.to_string(),
                refs: Cell::new(0),
                valid: Cell::new(true),
            }),
        }
    }

    /// Path inside the owning bundle
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Type tag the asset was loaded as
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.inner.type_tag
    }

    /// Decoded contents
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.inner.payload
    }

    /// Whether two handles point at the same resident instance
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl NativeAsset for MemoryAsset {
    fn add_ref(&self) {
        let refs = &self.inner.refs;
        refs.set(refs.get() + 1);
    }

    fn dec_ref(&self) {
        let refs = &self.inner.refs;
        refs.set(refs.get().saturating_sub(1));
    }

    fn ref_count(&self) -> u32 {
        self.inner.refs.get()
    }

    fn is_valid(&self) -> bool {
        self.inner.valid.get()
    }
}

#[derive(Debug, Default)]
struct BundleState {
    loaded: bool,
    /// path -> type tag -> payload
    sources: FxHashMap<String, FxHashMap<String, String>>,
    /// (path, type tag) -> resident asset
    resident: FxHashMap<(String, String), MemoryAsset>,
}

#[derive(Default)]
struct MemoryState {
    bundles: RefCell<FxHashMap<String, BundleState>>,
    jobs: RefCell<VecDeque<Job>>,
    failing: RefCell<FxHashSet<(String, String)>>,
    immediate: Cell<bool>,
    asset_loads: Cell<usize>,
    bundle_loads: Cell<usize>,
}

impl MemoryState {
    fn schedule(&self, job: Job) {
        if self.immediate.get() {
            job();
        } else {
            self.jobs.borrow_mut().push_back(job);
        }
    }

    fn load_asset(
        &self,
        bundle: &str,
        path: &str,
        type_tag: &str,
    ) -> Result<MemoryAsset, BackendError> {
        let key = (path.to_string(), type_tag.to_string());
        if self.failing.borrow().contains(&key) {
            return Err(BackendError::new(format!("failed to decode '{path}'")));
        }

        let mut bundles = self.bundles.borrow_mut();
        let Some(entry) = bundles.get_mut(bundle) else {
            return Err(BackendError::new(format!("unknown bundle '{bundle}'")));
        };
        let Some(payload) = entry.sources.get(path).and_then(|t| t.get(type_tag)) else {
            let message = format!("no '{type_tag}' asset at '{path}' in bundle '{bundle}'");
            return Err(BackendError::new(message));
        };
        let asset = MemoryAsset::new(path, type_tag, payload);
        Ok(entry.resident.entry(key).or_insert(asset).clone())
    }
}

/// Simulated engine bundle system.
///
/// Cloning yields another handle to the same engine state, so a test can keep
/// one clone while the cache owns another.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Rc<MemoryState>,
}

impl MemoryBackend {
    /// Create a backend with the default bundle already loaded
    #[must_use]
    pub fn new() -> Self {
        let backend = Self {
            state: Rc::new(MemoryState::default()),
        };
        backend.add_bundle(DEFAULT_BUNDLE, true);
        backend
    }

    /// Register a bundle, optionally already loaded
    pub fn add_bundle(&self, name: &str, loaded: bool) {
        let mut bundles = self.state.bundles.borrow_mut();
        let bundle = bundles.entry(name.to_string()).or_default();
        bundle.loaded |= loaded;
    }

    /// Register a loadable asset in a bundle
    pub fn add_asset(&self, bundle: &str, path: &str, type_tag: &str, payload: &str) {
        self.state
            .bundles
            .borrow_mut()
            .entry(bundle.to_string())
            .or_default()
            .sources
            .entry(path.to_string())
            .or_default()
            .insert(type_tag.to_string(), payload.to_string());
    }

    /// Make every future load of this asset report an error
    pub fn fail_asset(&self, path: &str, type_tag: &str) {
        self.state
            .failing
            .borrow_mut()
            .insert((path.to_string(), type_tag.to_string()));
    }

    /// Complete loads inline instead of on the next pump
    pub fn set_immediate(&self, immediate: bool) {
        self.state.immediate.set(immediate);
    }

    /// Run every completion queued before this call.
    ///
    /// Completions queued while pumping wait for the next pump, like I/O that
    /// finishes on a later frame. Returns the number of completions delivered.
    pub fn pump(&self) -> usize {
        let batch: Vec<Job> = self.state.jobs.borrow_mut().drain(..).collect();
        let count = batch.len();
        for job in batch {
            job();
        }
        count
    }

    /// Pump until no completions remain
    pub fn pump_all(&self) -> usize {
        let mut total = 0;
        loop {
            let delivered = self.pump();
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }

    /// Number of completions waiting for a pump
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.state.jobs.borrow().len()
    }

    /// Number of typed asset loads issued so far
    #[must_use]
    pub fn asset_loads(&self) -> usize {
        self.state.asset_loads.get()
    }

    /// Number of bundle loads issued so far
    #[must_use]
    pub fn bundle_loads(&self) -> usize {
        self.state.bundle_loads.get()
    }

    /// Look up a resident asset directly, bypassing any cache
    #[must_use]
    pub fn resident(&self, bundle: &str, path: &str, type_tag: &str) -> Option<MemoryAsset> {
        let key = (path.to_string(), type_tag.to_string());
        self.state
            .bundles
            .borrow()
            .get(bundle)
            .and_then(|b| b.resident.get(&key))
            .cloned()
    }

    fn bundle_handle(&self, name: &str) -> MemoryBundle {
        MemoryBundle {
            name: name.to_string(),
            state: Rc::clone(&self.state),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("bundles", &self.state.bundles.borrow().len())
            .field("pending_jobs", &self.pending_jobs())
            .field("asset_loads", &self.asset_loads())
            .finish()
    }
}

impl AssetBackend for MemoryBackend {
    type Asset = MemoryAsset;
    type Bundle = MemoryBundle;

    fn get_bundle(&self, name: &str) -> Option<MemoryBundle> {
        let loaded = self
            .state
            .bundles
            .borrow()
            .get(name)
            .is_some_and(|b| b.loaded);
        loaded.then(|| self.bundle_handle(name))
    }

    fn load_bundle(&self, name: &str, done: BundleCallback<MemoryBundle>) {
        let loads = &self.state.bundle_loads;
        loads.set(loads.get() + 1);

        let backend = self.clone();
        let name = name.to_string();
        self.state.schedule(Box::new(move || {
            let found = match backend.state.bundles.borrow_mut().get_mut(&name) {
                Some(bundle) => {
                    bundle.loaded = true;
                    true
                }
                None => false,
            };
            if found {
                done(Ok(backend.bundle_handle(&name)));
            } else {
                done(Err(BackendError::new(format!("unknown bundle '{name}'"))));
            }
        }));
    }
}

/// Bundle handle handed out by [`MemoryBackend`]
#[derive(Clone)]
pub struct MemoryBundle {
    name: String,
    state: Rc<MemoryState>,
}

impl std::fmt::Debug for MemoryBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBundle")
            .field("name", &self.name)
            .finish()
    }
}

impl Bundle for MemoryBundle {
    type Asset = MemoryAsset;

    fn name(&self) -> &str {
        &self.name
    }

    fn has_asset(&self, path: &str) -> bool {
        self.state
            .bundles
            .borrow()
            .get(&self.name)
            .is_some_and(|b| b.sources.contains_key(path))
    }

    fn get(&self, path: &str, type_tag: &str) -> Option<MemoryAsset> {
        let key = (path.to_string(), type_tag.to_string());
        self.state
            .bundles
            .borrow()
            .get(&self.name)
            .and_then(|b| b.resident.get(&key))
            .cloned()
    }

    fn load_typed(&self, path: &str, type_tag: &str, done: LoadCallback<MemoryAsset>) {
        let loads = &self.state.asset_loads;
        loads.set(loads.get() + 1);

        let state = Rc::clone(&self.state);
        let bundle = self.name.clone();
        let path = path.to_string();
        let type_tag = type_tag.to_string();
        self.state.schedule(Box::new(move || {
            done(state.load_asset(&bundle, &path, &type_tag));
        }));
    }

    fn release(&self, path: &str) {
        let mut bundles = self.state.bundles.borrow_mut();
        if let Some(bundle) = bundles.get_mut(&self.name) {
            bundle.resident.retain(|(resident_path, _), asset| {
                if resident_path == path {
                    asset.inner.valid.set(false);
                    false
                } else {
                    true
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Slot = Rc<RefCell<Option<Result<MemoryAsset, BackendError>>>>;

    fn load(bundle: &MemoryBundle, path: &str, type_tag: &str) -> Slot {
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        bundle.load_typed(path, type_tag, Box::new(move |result| {
            *out.borrow_mut() = Some(result);
        }));
        slot
    }

    #[test]
    fn test_load_completes_on_pump() {
        let backend = MemoryBackend::new();
        backend.add_asset(DEFAULT_BUNDLE, "icon", "Texture", "pixels");
        let bundle = backend.get_bundle(DEFAULT_BUNDLE).unwrap();

        let slot = load(&bundle, "icon", "Texture");
        assert!(slot.borrow().is_none());
        assert!(bundle.get("icon", "Texture").is_none());

        assert_eq!(backend.pump(), 1);
        let asset = slot.borrow_mut().take().unwrap().unwrap();
        assert_eq!(asset.payload(), "pixels");
        assert_eq!(asset.ref_count(), 0);
        assert!(bundle.get("icon", "Texture").unwrap().ptr_eq(&asset));
    }

    #[test]
    fn test_release_invalidates_resident_asset() {
        let backend = MemoryBackend::new();
        backend.set_immediate(true);
        backend.add_asset(DEFAULT_BUNDLE, "icon", "Texture", "pixels");
        let bundle = backend.get_bundle(DEFAULT_BUNDLE).unwrap();

        let slot = load(&bundle, "icon", "Texture");
        let asset = slot.borrow_mut().take().unwrap().unwrap();
        bundle.release("icon");

        assert!(!asset.is_valid());
        assert!(bundle.get("icon", "Texture").is_none());
    }

    #[test]
    fn test_failing_asset_reports_error() {
        let backend = MemoryBackend::new();
        backend.set_immediate(true);
        backend.add_asset(DEFAULT_BUNDLE, "broken", "Texture", "");
        backend.fail_asset("broken", "Texture");
        let bundle = backend.get_bundle(DEFAULT_BUNDLE).unwrap();

        let slot = load(&bundle, "broken", "Texture");
        let result = slot.borrow_mut().take().unwrap();
        assert!(result.is_err());
        assert_eq!(backend.asset_loads(), 1);
    }

    #[test]
    fn test_dec_ref_saturates_at_zero() {
        let asset = MemoryAsset::new("a", "Texture", "");
        asset.dec_ref();
        assert_eq!(asset.ref_count(), 0);
        asset.add_ref();
        asset.add_ref();
        asset.dec_ref();
        assert_eq!(asset.ref_count(), 1);
    }
}
