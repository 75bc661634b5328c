//! Engine collaborator interface
//!
//! The cache never loads or decodes anything itself. Bundle resolution, typed
//! asset loads and native reference counts all belong to the engine and are
//! reached through the traits in this module.
//!
//! Completions are delivered through boxed callbacks. A backend may invoke a
//! callback synchronously from inside the call that received it, or later from
//! its own pump on the main schedule; the cache handles both.

mod memory;

pub use memory::{MemoryAsset, MemoryBackend, MemoryBundle};

/// Name of the bundle that is always available without loading.
pub const DEFAULT_BUNDLE: &str = "resources";

/// Callback receiving the outcome of a bundle load.
pub type BundleCallback<B> = Box<dyn FnOnce(Result<B, BackendError>)>;

/// Callback receiving the outcome of a typed asset load.
pub type LoadCallback<A> = Box<dyn FnOnce(Result<A, BackendError>)>;

/// An engine asset carrying its own native reference count.
///
/// Implementors are cheap handles (an `Rc` or an index); cloning one must not
/// touch the reference count.
pub trait NativeAsset: Clone + 'static {
    /// Increment the native reference count
    fn add_ref(&self);

    /// Decrement the native reference count
    fn dec_ref(&self);

    /// Current native reference count
    fn ref_count(&self) -> u32;

    /// Whether the engine still considers this asset alive
    fn is_valid(&self) -> bool {
        true
    }
}

/// A named, independently loadable group of assets.
pub trait Bundle: Clone + 'static {
    /// Asset type produced by this bundle
    type Asset: NativeAsset;

    /// Bundle name
    fn name(&self) -> &str;

    /// Whether the bundle lists an asset at `path`
    fn has_asset(&self, path: &str) -> bool;

    /// Look up an already resident asset
    fn get(&self, path: &str, type_tag: &str) -> Option<Self::Asset>;

    /// Start loading the asset at `path` as `type_tag`
    fn load_typed(&self, path: &str, type_tag: &str, done: LoadCallback<Self::Asset>);

    /// Drop the asset at `path` from the bundle's cache
    fn release(&self, path: &str);
}

/// Entry point into the engine's bundle system.
pub trait AssetBackend: 'static {
    /// Native asset type
    type Asset: NativeAsset;
    /// Bundle type
    type Bundle: Bundle<Asset = Self::Asset>;

    /// Return the bundle if it is already loaded
    fn get_bundle(&self, name: &str) -> Option<Self::Bundle>;

    /// Start loading a bundle that is not yet available
    fn load_bundle(&self, name: &str, done: BundleCallback<Self::Bundle>);
}

/// Resolve a bundle by name, loading it first when necessary.
///
/// `done` receives `None` when the bundle cannot be loaded; the failure is
/// logged here so callers only have to handle the missing value.
pub fn resolve_bundle<B: AssetBackend>(
    backend: &B,
    name: &str,
    done: impl FnOnce(Option<B::Bundle>) + 'static,
) {
    let name = if name.is_empty() { DEFAULT_BUNDLE } else { name };

    if let Some(bundle) = backend.get_bundle(name) {
        done(Some(bundle));
        return;
    }

    let bundle_name = name.to_string();
    let on_loaded: BundleCallback<B::Bundle> = Box::new(move |result| match result {
        Ok(bundle) => done(Some(bundle)),
        Err(e) => {
            log::error!("Failed to load bundle '{bundle_name}': {e}");
            done(None);
        }
    });
    backend.load_bundle(name, on_loaded);
}

/// Error reported by the engine for a bundle or asset load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    message: String,
}

impl BackendError {
    /// Create a new backend error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Engine-provided message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendError {}
