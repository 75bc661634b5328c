//! Errors surfaced by the asset cache

use crate::backend::BackendError;

/// Errors that can occur during cache operations.
///
/// None of these are fatal: load paths degrade to a `None` result and release
/// paths report the error to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// The named bundle could not be loaded
    BundleResolution {
        /// Bundle name
        bundle: String,
    },
    /// The engine reported an error loading the asset
    AssetLoad {
        /// Asset id
        id: String,
        /// Engine error
        source: BackendError,
    },
    /// The consumer was destroyed before its request completed
    ConsumerInvalidated {
        /// Asset id
        id: String,
    },
    /// No handle exists for the asset id
    NotFound(String),
}

impl std::fmt::Display for AssetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BundleResolution { bundle } => write!(f, "Failed to resolve bundle '{bundle}'"),
            Self::AssetLoad { id, source } => write!(f, "Failed to load '{id}': {source}"),
            Self::ConsumerInvalidated { id } => {
                write!(f, "Consumer destroyed before '{id}' finished loading")
            }
            Self::NotFound(id) => write!(f, "No cached asset '{id}'"),
        }
    }
}

impl std::error::Error for AssetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AssetLoad { source, .. } => Some(source),
            _ => None,
        }
    }
}
