//! Support to load resources from HTTP servers.

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use reqwest::{Client, StatusCode, header};
use url::Url;

use crate::caching::{PreloadError, PreloadResult};
use crate::types::{PreloadRequest, Resource, ResourceKind};
use crate::utils::http::LoadTimeouts;

use super::ResourceLoader;

/// Loader implementation that fetches resources over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: Client,
    timeouts: LoadTimeouts,
}

impl HttpLoader {
    pub fn new(client: Client, timeouts: LoadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Fetches `url`, giving up after the configured load timeout.
    pub fn load_url(
        &self,
        url: Url,
        kind: ResourceKind,
    ) -> BoxFuture<'static, PreloadResult<Resource>> {
        let timeout = self.timeouts.load;
        let request = self.client.get(url.clone());

        async move {
            tracing::debug!("Fetching resource from `{}`", url);

            let fetch = async {
                let response = request.send().await.map_err(PreloadError::load)?;

                let status = response.status();
                if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
                    tracing::debug!("Resource `{}` does not exist: {}", url, status);
                    return Err(PreloadError::NotFound);
                }
                if !status.is_success() {
                    tracing::debug!("Unexpected status code from `{}`: {}", url, status);
                    return Err(PreloadError::load(anyhow::anyhow!(
                        "unexpected status {status}"
                    )));
                }

                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.to_owned());
                let data = response.bytes().await.map_err(PreloadError::load)?;

                let resource = Resource::new(kind, data);
                Ok(match content_type {
                    Some(content_type) => resource.with_content_type(content_type),
                    None => resource,
                })
            };

            tokio::time::timeout(timeout, fetch)
                .await
                .map_err(|_| PreloadError::Timeout(timeout))?
        }
        .boxed()
    }
}

impl ResourceLoader for HttpLoader {
    fn load(&self, request: &PreloadRequest) -> BoxFuture<'static, PreloadResult<Resource>> {
        match Url::parse(&request.key) {
            Ok(url) => self.load_url(url, request.kind.clone()),
            Err(err) => future::ready(Err(PreloadError::load(err))).boxed(),
        }
    }
}
