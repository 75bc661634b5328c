//! Cache statistics

/// Point-in-time snapshot of cache bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Handles in the registry
    pub handles: usize,
    /// Handles whose backing asset is resident
    pub resident: usize,
    /// Handles with a load in flight
    pub loading: usize,
    /// Sum of dynamic reference counts
    pub dynamic_refs: u64,
    /// Holds waiting out the hold window
    pub pending_releases: usize,
    /// Requests waiting in the load queue
    pub queued: usize,
    /// Live consumers
    pub consumers: usize,
    /// Holds released by sweeps since startup
    pub released_total: u64,
}

impl CacheStats {
    /// Get a formatted stats string
    #[must_use]
    pub fn format_stats(&self) -> String {
        format!(
            "Assets: {} ({} resident, {} loading) | Refs: {} held, {} pending | Queue: {} | Consumers: {} | Released: {}",
            self.handles,
            self.resident,
            self.loading,
            self.dynamic_refs,
            self.pending_releases,
            self.queued,
            self.consumers,
            self.released_total
        )
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_stats())
    }
}
