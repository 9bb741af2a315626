//! Prefetches media resources into a bounded, expiring in-memory cache.
//!
//! The entry point is the [`Preloader`](preload::Preloader), which takes batches of
//! [`PreloadRequest`](types::PreloadRequest)s, loads them in priority order without ever loading
//! the same key twice at once, and reports a per-key outcome.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod preload;
pub mod scheduler;
pub mod settings;
pub mod types;
pub mod utils;
