//! Asset identity
//!
//! An asset is named by its bundle, its path inside the bundle and the type it
//! is loaded as. The same path loaded as two different types is two distinct
//! cache entries.

use std::fmt;

use crate::backend::DEFAULT_BUNDLE;

/// Separator between bundle name and path in URIs and ids
const SCHEME_SEPARATOR: &str = "://";

/// Immutable (bundle, path, type) identity of a cacheable asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    bundle: String,
    path: String,
    type_tag: String,
    /// `bundle://path/type`, precomputed for map lookups
    id: String,
}

impl AssetKey {
    /// Create a key. An empty bundle name means the default bundle.
    pub fn new(
        bundle: impl Into<String>,
        path: impl Into<String>,
        type_tag: impl Into<String>,
    ) -> Self {
        let mut bundle = bundle.into();
        if bundle.is_empty() {
            bundle = DEFAULT_BUNDLE.to_string();
        }
        let path = path.into();
        let type_tag = type_tag.into();
        let id = format!("{bundle}{SCHEME_SEPARATOR}{path}/{type_tag}");
        Self {
            bundle,
            path,
            type_tag,
            id,
        }
    }

    /// Create a key whose type tag is the short name of `T`
    pub fn typed<T: ?Sized>(bundle: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(bundle, path, short_type_name::<T>())
    }

    /// Create a key from a `bundle://path` URI
    pub fn from_uri(uri: &str, type_tag: impl Into<String>) -> Self {
        let (bundle, path) = parse_uri(uri);
        Self::new(bundle, path, type_tag)
    }

    /// Bundle name
    #[must_use]
    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    /// Path inside the bundle
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Type tag the asset is loaded as
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Unique string id: `bundle://path/type`
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `bundle://path`, without the type
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}{SCHEME_SEPARATOR}{}", self.bundle, self.path)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Split `bundle://path` into `(bundle, path)`.
///
/// A string without `://` is a path in the default bundle.
#[must_use]
pub fn parse_uri(uri: &str) -> (&str, &str) {
    match uri.split_once(SCHEME_SEPARATOR) {
        Some((bundle, path)) if !bundle.is_empty() => (bundle, path),
        Some((_, path)) => (DEFAULT_BUNDLE, path),
        None => (DEFAULT_BUNDLE, uri),
    }
}

/// Last path segment of `type_name::<T>()`, generics stripped
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
