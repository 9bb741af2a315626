use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::CapacityAdapterConfig;
use crate::settings::RuntimeSettings;

use super::ResourceCache;

/// Slack applied before rounding, so that e.g. `10 * 1.1` grows to `11` and not `12`.
const ROUNDING_SLACK: f64 = 1e-9;

/// A source for the memory-pressure signal.
pub trait MemoryMonitor: Send + Sync + 'static {
    /// The currently available memory in MiB, or `None` if it cannot be determined.
    fn available_mib(&self) -> Option<u64>;
}

/// Reads the available memory of the host system.
///
/// The signal is unavailable on platforms where `sysinfo` cannot report memory.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        let refresh = RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram());
        Self {
            system: Mutex::new(System::new_with_specifics(refresh)),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemory").finish_non_exhaustive()
    }
}

impl MemoryMonitor for SystemMemory {
    fn available_mib(&self) -> Option<u64> {
        let mut system = self.system.lock();
        system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        // a zero total means the platform is not supported
        if system.total_memory() == 0 {
            return None;
        }
        Some(system.available_memory() / (1024 * 1024))
    }
}

/// A memory monitor reporting a value set by hand.
#[derive(Debug, Default)]
pub struct FixedMemory(AtomicU64);

impl FixedMemory {
    const UNAVAILABLE: u64 = u64::MAX;

    pub fn new(available_mib: Option<u64>) -> Self {
        let this = Self(AtomicU64::new(Self::UNAVAILABLE));
        this.set(available_mib);
        this
    }

    pub fn set(&self, available_mib: Option<u64>) {
        let value = available_mib.unwrap_or(Self::UNAVAILABLE);
        self.0.store(value, AtomicOrdering::Relaxed);
    }
}

impl MemoryMonitor for FixedMemory {
    fn available_mib(&self) -> Option<u64> {
        match self.0.load(AtomicOrdering::Relaxed) {
            Self::UNAVAILABLE => None,
            value => Some(value),
        }
    }
}

/// What a single [`CapacityAdapter`] run did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityChange {
    /// The memory signal could not be sampled.
    Unavailable,
    /// The capacity stayed as it was.
    Unchanged(usize),
    Shrunk { from: usize, to: usize },
    Grown { from: usize, to: usize },
}

/// Grows or shrinks the cache capacity based on available memory.
///
/// Below the memory threshold the capacity shrinks by `shrink_factor` down to `min_capacity`,
/// above it the capacity grows by `grow_factor` up to `max_capacity`. Shrinking rounds down
/// and growing rounds up, so every adjustment moves by at least one entry and repeated samples
/// settle at the bounds instead of oscillating.
pub struct CapacityAdapter {
    cache: ResourceCache,
    settings: Arc<RuntimeSettings>,
    monitor: Arc<dyn MemoryMonitor>,
    config: CapacityAdapterConfig,
}

impl fmt::Debug for CapacityAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityAdapter")
            .field("cache", &self.cache)
            .field("memory_threshold", &self.settings.memory_threshold())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CapacityAdapter {
    pub fn new(
        cache: ResourceCache,
        settings: Arc<RuntimeSettings>,
        monitor: Arc<dyn MemoryMonitor>,
        config: CapacityAdapterConfig,
    ) -> Self {
        Self {
            cache,
            settings,
            monitor,
            config,
        }
    }

    fn target_capacity(&self, current: usize, available_mib: u64) -> usize {
        let config = &self.config;
        let scaled = |factor: f64| current as f64 * factor;

        match available_mib.cmp(&self.settings.memory_threshold()) {
            Ordering::Less => {
                let shrunk = (scaled(config.shrink_factor) + ROUNDING_SLACK).floor() as usize;
                shrunk.max(config.min_capacity).min(current)
            }
            Ordering::Greater => {
                let grown = (scaled(config.grow_factor) - ROUNDING_SLACK).ceil() as usize;
                grown.min(config.max_capacity).max(current)
            }
            Ordering::Equal => current,
        }
    }

    /// Samples the memory signal once and adjusts the cache capacity.
    pub fn run_once(&self) -> CapacityChange {
        let Some(available_mib) = self.monitor.available_mib() else {
            tracing::trace!("Memory signal unavailable, keeping cache capacity");
            return CapacityChange::Unavailable;
        };

        let current = self.cache.capacity();
        let target = self.target_capacity(current, available_mib);
        if target == current {
            return CapacityChange::Unchanged(current);
        }

        if let Err(err) = self.cache.set_capacity(target) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to adapt cache capacity"
            );
            return CapacityChange::Unchanged(current);
        }

        tracing::info!(
            available_mib,
            from = current,
            to = target,
            "Adapted cache capacity to memory pressure"
        );

        if target < current {
            CapacityChange::Shrunk {
                from: current,
                to: target,
            }
        } else {
            CapacityChange::Grown {
                from: current,
                to: target,
            }
        }
    }

    /// Spawns the adapter onto the current runtime, sampling once every `period` until
    /// `shutdown` is cancelled.
    pub fn spawn(self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_once();
                    }
                }
            }
            tracing::debug!("Capacity adapter stopped");
        })
    }
}
