use std::time::Duration;

use reqwest::header;

use crate::config::LoaderConfig;

/// HTTP User-Agent string to use.
pub const USER_AGENT: &str = concat!("preloader/", env!("CARGO_PKG_VERSION"));

/// Timeouts shared by all resource loaders.
#[derive(Copy, Clone, Debug)]
pub struct LoadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for loading one resource.
    pub load: Duration,
}

impl LoadTimeouts {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            load: config.load_timeout,
        }
    }
}

impl Default for LoadTimeouts {
    fn default() -> Self {
        Self::from_config(&LoaderConfig::default())
    }
}

/// Creates a [`reqwest::Client`] for fetching resources.
///
/// Only the connect timeout is applied to the client. The overall load timeout is enforced by
/// the loader itself, so that it surfaces as
/// [`PreloadError::Timeout`](crate::caching::PreloadError::Timeout).
pub fn create_client(timeouts: &LoadTimeouts) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));

    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .default_headers(headers)
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
