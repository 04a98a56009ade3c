//! # Concurrent Access Vector Cache
//!
//! A bounded, hash-bucketed, read-mostly cache of authorisation
//! decisions:
//!
//! - **Lock-free lookup**: readers walk bucket chains without taking any
//!   lock, inside an epoch-pinned reader critical section.
//! - **Per-bucket writer locks**: chain surgery takes only the owning
//!   bucket's mutex, never a global lock.
//! - **Deferred reclamation**: unlinked nodes are handed to the epoch
//!   reclaimer and freed only after every reader critical section that
//!   could hold a reference has ended.
//! - **Approximate-LRU eviction**: when the node count crosses the
//!   configured threshold, a rotating hint sweeps buckets and reclaims a
//!   bounded batch of nodes, skipping contended buckets.
//! - **Copy-on-write updates**: linked nodes are immutable; every update
//!   clones, modifies, and atomically replaces.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{ObjectClass, SecurityId};

pub mod node;
pub mod table;

pub use node::AvcNode;
pub use table::{CacheTable, UpdateEvent};

/// Number of hash buckets. Power of two.
pub const N_SLOTS: usize = 512;

/// Default node-count threshold above which eviction runs.
pub const DEFAULT_CACHE_THRESHOLD: usize = 512;

/// Default maximum nodes reclaimed per evictor pass.
pub const DEFAULT_RECLAIM_BATCH: usize = 16;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Node-count threshold above which the evictor runs.
    pub cache_threshold: usize,

    /// Maximum nodes reclaimed per evictor pass.
    pub reclaim_batch: usize,

    /// Enable statistics collection.
    pub stats_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_threshold: DEFAULT_CACHE_THRESHOLD,
            reclaim_batch: DEFAULT_RECLAIM_BATCH,
            stats_enabled: true,
        }
    }
}

/// Bucket index for a cache key.
pub fn bucket_index(ssid: SecurityId, tsid: SecurityId, tclass: ObjectClass) -> usize {
    ((ssid ^ (tsid << 2) ^ (u32::from(tclass) << 4)) & (N_SLOTS as u32 - 1)) as usize
}

/// Cache statistics counters.
///
/// Counters are plain relaxed atomics; collection can be disabled via
/// [`CacheConfig::stats_enabled`], which turns every recording call into
/// a no-op.
#[derive(Debug, Default)]
pub struct CacheStats {
    enabled: bool,
    lookups: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    reclaims: AtomicU64,
    frees: AtomicU64,
}

/// Point-in-time copy of the statistics counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Total lookups served.
    pub lookups: u64,

    /// Lookups that missed.
    pub misses: u64,

    /// Nodes allocated.
    pub allocations: u64,

    /// Nodes reclaimed by the evictor.
    pub reclaims: u64,

    /// Nodes handed to the reclaimer.
    pub frees: u64,
}

impl CacheStats {
    /// Creates counters; recording is a no-op when disabled.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        if !self.enabled {
            return;
        }
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if !hit {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_allocation(&self) {
        if self.enabled {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reclaim(&self) {
        if self.enabled {
            self.reclaims.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_free(&self) {
        if self.enabled {
            self.frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total lookups served.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Lookups that missed.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}
