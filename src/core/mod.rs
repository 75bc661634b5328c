//! Core cache module
//!
//! Contains the `AssetCache` facade, its configuration and statistics

mod cache;
mod config;
mod stats;

pub use cache::AssetCache;
pub use config::{CacheConfig, ConfigError};
pub use stats::CacheStats;
