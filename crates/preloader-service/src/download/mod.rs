//! Loaders that turn a [`PreloadRequest`] into a [`Resource`].
//!
//! The preloader dispatches every request through a [`Loaders`] registry, which selects the
//! loader by [`ResourceKind`]. The built-in [`DefaultLoader`] fetches `http(s)://` URLs with
//! [`HttpLoader`] and `file://` URLs or plain paths with [`FilesystemLoader`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use url::Url;

use crate::caching::{PreloadError, PreloadResult};
use crate::config::LoaderConfig;
use crate::types::{PreloadRequest, Resource, ResourceKind};
use crate::utils::http::{LoadTimeouts, create_client};

mod filesystem;
mod http;

pub use self::filesystem::FilesystemLoader;
pub use self::http::HttpLoader;

/// Loads the payload of a single resource.
///
/// Loaders are responsible for enforcing their own timeouts and signal them as
/// [`PreloadError::Timeout`]. The returned future must not borrow from the loader, so the
/// preloader can run it on a separate task.
pub trait ResourceLoader: Send + Sync + 'static {
    fn load(&self, request: &PreloadRequest) -> BoxFuture<'static, PreloadResult<Resource>>;
}

/// A registry of resource loaders by [`ResourceKind`].
#[derive(Clone, Default)]
pub struct Loaders {
    by_kind: HashMap<ResourceKind, Arc<dyn ResourceLoader>>,
}

impl fmt::Debug for Loaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.by_kind.keys().map(ResourceKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("Loaders").field("kinds", &kinds).finish()
    }
}

impl Loaders {
    /// Creates an empty registry. Every request fails with [`PreloadError::UnsupportedKind`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the built-in [`DefaultLoader`] for images, audio and video.
    pub fn from_config(config: &LoaderConfig) -> anyhow::Result<Self> {
        let loader = DefaultLoader::from_config(config)?;
        Ok(Self::new()
            .with(ResourceKind::Image, loader.clone())
            .with(ResourceKind::Audio, loader.clone())
            .with(ResourceKind::Video, loader))
    }

    /// Registers `loader` for `kind`, replacing any previous one.
    pub fn with(mut self, kind: ResourceKind, loader: impl ResourceLoader) -> Self {
        self.by_kind.insert(kind, Arc::new(loader));
        self
    }

    pub fn supports(&self, kind: &ResourceKind) -> bool {
        self.by_kind.contains_key(kind)
    }

    /// Starts loading `request` with the loader registered for its kind.
    pub fn load(&self, request: &PreloadRequest) -> BoxFuture<'static, PreloadResult<Resource>> {
        match self.by_kind.get(&request.kind) {
            Some(loader) => loader.load(request),
            None => {
                let err = PreloadError::UnsupportedKind(request.kind.clone());
                future::ready(Err(err)).boxed()
            }
        }
    }
}

/// Dispatches to the HTTP or filesystem loader based on the key's URL scheme.
///
/// Keys that are not absolute URLs are treated as paths.
#[derive(Debug, Clone)]
pub struct DefaultLoader {
    http: HttpLoader,
    fs: FilesystemLoader,
}

impl DefaultLoader {
    pub fn new(http: HttpLoader, fs: FilesystemLoader) -> Self {
        Self { http, fs }
    }

    pub fn from_config(config: &LoaderConfig) -> anyhow::Result<Self> {
        let timeouts = LoadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;
        let base_dir = match &config.base_dir {
            Some(base_dir) => base_dir.clone(),
            None => std::env::current_dir()?,
        };

        Ok(Self::new(
            HttpLoader::new(client, timeouts),
            FilesystemLoader::new(base_dir, timeouts),
        ))
    }
}

impl ResourceLoader for DefaultLoader {
    fn load(&self, request: &PreloadRequest) -> BoxFuture<'static, PreloadResult<Resource>> {
        let url = match Url::parse(&request.key) {
            Ok(url) => url,
            // relative paths, and windows paths which parse as a one-letter scheme
            Err(_) => return self.fs.load(request),
        };

        match url.scheme() {
            "http" | "https" => self.http.load_url(url, request.kind.clone()),
            "file" => self.fs.load(request),
            scheme if scheme.len() == 1 => self.fs.load(request),
            scheme => {
                let error = anyhow::anyhow!("unsupported URL scheme `{scheme}`");
                future::ready(Err(PreloadError::load(error))).boxed()
            }
        }
    }
}

/// Guesses the media type from a file extension.
pub fn content_type_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match extension.as_str() {
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "oga" | "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" | "m4v" => "video/mp4",
        "ogv" => "video/ogg",
        "webm" => "video/webm",
        _ => return None,
    })
}
