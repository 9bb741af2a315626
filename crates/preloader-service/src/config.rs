use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the preloader.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "preloader".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing and expiry of the in-memory resource cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached resources.
    pub capacity: usize,

    /// Maximum age of a cached resource (time since insertion).
    #[serde(with = "humantime_serde")]
    pub cache_duration: Duration,

    /// How often expired resources are swept from the cache.
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            cache_duration: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Adapts the cache capacity to available memory.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapacityAdapterConfig {
    /// Whether the adapter runs at all.
    pub enabled: bool,

    /// How often available memory is sampled.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Available memory in MiB below which the cache shrinks, and above which it grows.
    pub memory_threshold: u64,

    /// Factor applied to the capacity under memory pressure. Must be below `1.0`.
    pub shrink_factor: f64,

    /// Factor applied to the capacity without memory pressure. Must be above `1.0`.
    pub grow_factor: f64,

    /// The capacity never shrinks below this.
    pub min_capacity: usize,

    /// The capacity never grows above this.
    pub max_capacity: usize,
}

impl Default for CapacityAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10 * 60),
            memory_threshold: 512,
            shrink_factor: 0.9,
            grow_factor: 1.1,
            min_capacity: 10,
            max_capacity: 100,
        }
    }
}

/// Settings for the built-in resource loaders.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Timeout for establishing an HTTP connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for loading a single resource, including the connection.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,

    /// Directory that relative resource paths are resolved against.
    ///
    /// Defaults to the current working directory.
    pub base_dir: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            load_timeout: Duration::from_secs(30),
            base_dir: None,
        }
    }
}

/// Dispatch of preload batches.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PreloadConfig {
    /// How many loads may be in flight at once.
    ///
    /// Loads always start in priority order, regardless of this value.
    pub max_concurrent_loads: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 1,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The resource cache.
    pub cache: CacheConfig,

    /// Memory driven sizing of the resource cache.
    pub capacity_adapter: CapacityAdapterConfig,

    /// The built-in resource loaders.
    pub loaders: LoaderConfig,

    /// Batch dispatch.
    pub preload: PreloadConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the preloader cannot run with.
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        ensure!(cache.capacity > 0, "cache.capacity must be at least 1");
        ensure!(
            !cache.cache_duration.is_zero(),
            "cache.cache_duration must not be zero"
        );
        ensure!(
            !cache.reap_interval.is_zero(),
            "cache.reap_interval must not be zero"
        );

        let adapter = &self.capacity_adapter;
        ensure!(
            !adapter.interval.is_zero(),
            "capacity_adapter.interval must not be zero"
        );
        ensure!(
            adapter.memory_threshold > 0,
            "capacity_adapter.memory_threshold must not be zero"
        );
        ensure!(
            adapter.shrink_factor > 0.0 && adapter.shrink_factor < 1.0,
            "capacity_adapter.shrink_factor must be between 0 and 1, got {}",
            adapter.shrink_factor
        );
        ensure!(
            adapter.grow_factor > 1.0 && adapter.grow_factor.is_finite(),
            "capacity_adapter.grow_factor must be above 1, got {}",
            adapter.grow_factor
        );
        ensure!(
            adapter.min_capacity > 0,
            "capacity_adapter.min_capacity must be at least 1"
        );
        ensure!(
            adapter.min_capacity <= adapter.max_capacity,
            "capacity_adapter.min_capacity ({}) exceeds max_capacity ({})",
            adapter.min_capacity,
            adapter.max_capacity
        );

        ensure!(
            !self.loaders.load_timeout.is_zero(),
            "loaders.load_timeout must not be zero"
        );
        ensure!(
            self.preload.max_concurrent_loads > 0,
            "preload.max_concurrent_loads must be at least 1"
        );

        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
