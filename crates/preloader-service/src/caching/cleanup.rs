use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::settings::RuntimeSettings;

use super::ResourceCache;

/// Periodically removes cached resources that outlived the configured cache duration.
#[derive(Clone, Debug)]
pub struct TtlReaper {
    cache: ResourceCache,
    settings: Arc<RuntimeSettings>,
}

impl TtlReaper {
    pub fn new(cache: ResourceCache, settings: Arc<RuntimeSettings>) -> Self {
        Self { cache, settings }
    }

    /// Runs a single sweep, returning the number of removed entries.
    ///
    /// Works on a snapshot of the cached keys. Each entry is checked and removed atomically, so
    /// entries inserted or deleted concurrently are never removed by mistake.
    pub fn run_once(&self) -> usize {
        let max_age = self.settings.cache_duration();
        let now = Instant::now();

        let mut removed = 0;
        for key in self.cache.keys() {
            if self.cache.remove_expired(&key, max_age, now) {
                tracing::debug!(key = %key, "Removed expired resource from cache");
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, ?max_age, "Expired cached resources");
            metric!(counter("cache.expired") += removed as i64);
        }
        removed
    }

    /// Spawns the reaper onto the current runtime, sweeping once every `period` until
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
            tracing::debug!("TTL reaper stopped");
        })
    }
}
