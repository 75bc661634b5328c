//! Reference-counted asset cache
//!
//! Provides:
//! - One shared handle per (bundle, path, type) identity
//! - Per-consumer ownership with automatic release on destruction
//! - Deferred release through a hold window to absorb reacquire churn
//! - A serialized load queue to avoid load storms

mod error;
mod handle;
mod key;
mod owners;
mod queue;
mod registry;

pub use error::AssetError;
pub use handle::AssetHandle;
pub use key::{AssetKey, parse_uri};
pub use owners::ConsumerId;
pub use queue::LoadCoordinator;
pub use registry::HandleRegistry;
