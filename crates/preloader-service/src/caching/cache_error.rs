use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Payload, ResourceKind};

/// Misuse of the [`ResourceCache`](super::ResourceCache).
///
/// These do not happen under correct orchestration; the preloader checks the cache before it
/// inserts and validates capacities before applying them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The key is already cached.
    #[error("resource `{0}` is already cached")]
    DuplicateKey(String),
    /// Capacities must be at least `1`.
    #[error("invalid cache capacity {0}, must be at least 1")]
    InvalidCapacity(usize),
}

/// The underlying cause of a failed load.
///
/// Cheap to clone, so the same failure can be handed to every caller that joined the load.
#[derive(Clone)]
pub struct LoadFailure(Arc<anyhow::Error>);

impl LoadFailure {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }
}

impl fmt::Debug for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl Error for LoadFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        let inner: &(dyn Error + Send + Sync + 'static) = (*self.0).as_ref();
        Some(inner)
    }
}

/// An error that happens while preloading a single resource.
///
/// Failures are reported per key and never abort the rest of a batch.
#[derive(Debug, Clone, Error)]
pub enum PreloadError {
    /// No loader is registered for the requested kind.
    #[error("no loader registered for `{0}` resources")]
    UnsupportedKind(ResourceKind),
    /// The loader gave up after its configured per-load timeout.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// The resource does not exist at its location.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched or decoded.
    #[error("load failed: {0}")]
    Load(#[source] LoadFailure),
    /// The load was cancelled before it completed.
    #[error("load cancelled")]
    Cancelled,
    /// A runtime setting was rejected.
    #[error("invalid value `{value}` for `{name}`")]
    InvalidSetting { name: &'static str, value: String },
    /// The cache rejected an operation.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The load task went away without reporting a result.
    #[error("internal error")]
    InternalError,
}

impl PreloadError {
    /// Wraps an arbitrary loader error, keeping it as the source.
    pub fn load(error: impl Into<anyhow::Error>) -> Self {
        Self::Load(LoadFailure::new(error))
    }

    /// A short tag for metrics and logs.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::UnsupportedKind(_) => "unsupported",
            Self::Timeout(_) => "timeout",
            Self::NotFound => "notfound",
            Self::Load(_) => "error",
            Self::Cancelled => "cancelled",
            Self::InvalidSetting { .. } => "invalid",
            Self::Cache(_) => "cache",
            Self::InternalError => "internal",
        }
    }
}

impl PartialEq for PreloadError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::UnsupportedKind(a), Self::UnsupportedKind(b)) => a == b,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::NotFound, Self::NotFound) => true,
            // load failures carry arbitrary errors, compare what they say
            (Self::Load(a), Self::Load(b)) => a.to_string() == b.to_string(),
            (Self::Cancelled, Self::Cancelled) => true,
            (
                Self::InvalidSetting { name, value },
                Self::InvalidSetting {
                    name: other_name,
                    value: other_value,
                },
            ) => name == other_name && value == other_value,
            (Self::Cache(a), Self::Cache(b)) => a == b,
            (Self::InternalError, Self::InternalError) => true,
            _ => false,
        }
    }
}

/// The outcome of preloading a single resource: the loaded payload, or why there is none.
pub type PreloadResult<T = Payload> = Result<T, PreloadError>;
