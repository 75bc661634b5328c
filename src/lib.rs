//! Reference-counted asset cache for bundle-based game engines
//!
//! This crate provides:
//! - Deduplicated loads: one handle and one in-flight load per asset identity
//! - Per-consumer ownership released automatically when the consumer dies
//! - Deferred release through a hold window to absorb show/hide churn
//! - A serialized load queue that keeps at most one queued load in flight
//!
//! The engine's bundle loader sits behind the traits in [`backend`].

pub mod assets;
pub mod backend;
pub mod core;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::assets::{
        AssetError, AssetHandle, AssetKey, ConsumerId, HandleRegistry, LoadCoordinator,
    };
    pub use crate::backend::{
        AssetBackend, BackendError, Bundle, MemoryAsset, MemoryBackend, NativeAsset,
    };
    pub use crate::core::{AssetCache, CacheConfig, CacheStats};
}
