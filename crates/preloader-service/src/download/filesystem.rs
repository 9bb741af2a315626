//! Support to load resources from the local filesystem.

use std::io;
use std::path::PathBuf;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use url::Url;

use crate::caching::{PreloadError, PreloadResult};
use crate::types::{PreloadRequest, Resource};
use crate::utils::http::LoadTimeouts;

use super::{ResourceLoader, content_type_for_path};

/// Loader implementation that reads resources from disk.
///
/// Accepts `file://` URLs and plain paths. Relative paths are resolved against `base_dir`.
#[derive(Debug, Clone)]
pub struct FilesystemLoader {
    base_dir: PathBuf,
    timeouts: LoadTimeouts,
}

impl FilesystemLoader {
    pub fn new(base_dir: impl Into<PathBuf>, timeouts: LoadTimeouts) -> Self {
        Self {
            base_dir: base_dir.into(),
            timeouts,
        }
    }

    fn resolve(&self, key: &str) -> PreloadResult<PathBuf> {
        if key.starts_with("file:") {
            let url = Url::parse(key).map_err(PreloadError::load)?;
            return url
                .to_file_path()
                .map_err(|_| PreloadError::load(anyhow::anyhow!("not a local file URL")));
        }
        Ok(self.base_dir.join(key))
    }
}

impl ResourceLoader for FilesystemLoader {
    fn load(&self, request: &PreloadRequest) -> BoxFuture<'static, PreloadResult<Resource>> {
        let path = match self.resolve(&request.key) {
            Ok(path) => path,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let kind = request.kind.clone();
        let timeout = self.timeouts.load;

        async move {
            tracing::debug!("Reading resource from {:?}", path);

            let read = tokio::fs::read(&path);
            let data = tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| PreloadError::Timeout(timeout))?
                .map_err(|err| match err.kind() {
                    io::ErrorKind::NotFound => PreloadError::NotFound,
                    _ => PreloadError::load(err),
                })?;

            let resource = Resource::new(kind, data);
            Ok(match content_type_for_path(&path) {
                Some(content_type) => resource.with_content_type(content_type),
                None => resource,
            })
        }
        .boxed()
    }
}
