//! Runtime-adjustable settings shared between the preloader and its background tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::caching::PreloadError;

/// Settings that can be changed while the preloader runs.
///
/// Values are read on every reaper and adapter run, so changes take effect on the next run.
/// Invalid values are rejected and leave the previous value in place.
#[derive(Debug)]
pub struct RuntimeSettings {
    cache_duration_ms: AtomicU64,
    memory_threshold_mib: AtomicU64,
}

impl RuntimeSettings {
    pub fn new(cache_duration: Duration, memory_threshold_mib: u64) -> Result<Self, PreloadError> {
        let settings = Self {
            cache_duration_ms: AtomicU64::new(0),
            memory_threshold_mib: AtomicU64::new(0),
        };
        settings.set_cache_duration(cache_duration)?;
        settings.set_memory_threshold(memory_threshold_mib)?;
        Ok(settings)
    }

    /// How long a cached resource lives before the reaper removes it.
    pub fn cache_duration(&self) -> Duration {
        Duration::from_millis(self.cache_duration_ms.load(Ordering::Relaxed))
    }

    /// Sets the cache duration, rejecting anything below one millisecond.
    pub fn set_cache_duration(&self, duration: Duration) -> Result<(), PreloadError> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Err(PreloadError::InvalidSetting {
                name: "cache_duration",
                value: format!("{duration:?}"),
            });
        }
        self.cache_duration_ms.store(millis, Ordering::Relaxed);
        tracing::debug!(?duration, "Updated cache duration");
        Ok(())
    }

    /// Available memory (in MiB) below which the cache shrinks.
    pub fn memory_threshold(&self) -> u64 {
        self.memory_threshold_mib.load(Ordering::Relaxed)
    }

    pub fn set_memory_threshold(&self, mib: u64) -> Result<(), PreloadError> {
        if mib == 0 {
            return Err(PreloadError::InvalidSetting {
                name: "memory_threshold",
                value: mib.to_string(),
            });
        }
        self.memory_threshold_mib.store(mib, Ordering::Relaxed);
        tracing::debug!(mib, "Updated memory threshold");
        Ok(())
    }
}
