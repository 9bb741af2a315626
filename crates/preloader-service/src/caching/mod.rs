//! # Preloader caching infrastructure
//!
//! Loaded resources are kept in a single in-memory [`ResourceCache`] that is bounded by a
//! number of entries. Three actors mutate it:
//!
//! - The [`Preloader`](crate::preload::Preloader) inserts freshly loaded resources. When the
//!   cache is full, the earliest inserted entries are evicted.
//! - The [`TtlReaper`] periodically removes entries that outlived the configured cache duration.
//! - The [`CapacityAdapter`] periodically grows or shrinks the capacity depending on how much
//!   memory is available, evicting entries when the cache shrinks below its size.
//!
//! All of them go through the same lock, and every cache operation is one critical section.
//! The reaper works on a snapshot of keys and checks each entry's age under the lock, so it never
//! races with concurrent inserts.
//!
//! ### Metrics
//!
//! - `cache.entries`, `cache.capacity`: Gauges, reported after every mutation.
//! - `cache.evictions`: Entries evicted to satisfy the capacity.
//! - `cache.expired`: Entries removed by the reaper.

mod cache_error;
mod capacity;
mod cleanup;
mod memory;

pub use cache_error::{CacheError, LoadFailure, PreloadError, PreloadResult};
pub use capacity::{CapacityAdapter, CapacityChange, FixedMemory, MemoryMonitor, SystemMemory};
pub use cleanup::TtlReaper;
pub use memory::{CacheStats, CachedResource, ResourceCache};
