//! Helpers for testing the preloader.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let _media_dir = test::tempdir()`).
//!
//!  - When using [`HitCounter`] or [`Server`], make sure that the server is held until all
//!    requests to the server have been made. If the server is dropped, connections to it fail.
//!
//!  - [`MockLoader`] does not touch the network and is the fastest way to exercise the
//!    preloader. It respects `tokio::time::pause`, so delays are free in paused tests.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Router, middleware};
use futures::FutureExt;
use futures::future::BoxFuture;
use tower_http::services::ServeDir;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

use preloader_service::caching::{PreloadError, PreloadResult};
use preloader_service::download::ResourceLoader;
use preloader_service::preload::PreloadOutcomes;
use preloader_service::types::{PreloadRequest, Resource};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the preloader crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("preloader_service=trace,preloader=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns the absolute path to the given fixture.
///
/// Fixtures are located in the `tests/fixtures` directory, located from the workspace root.
/// Fixtures can be either files, or directories.
///
/// # Panics
///
/// Panics if the fixture path does not exist on the file system.
pub fn fixture(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();

    let mut full_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    full_path.pop(); // to /crates/
    full_path.pop(); // to /
    full_path.push("./tests/fixtures/");
    full_path.push(path);

    assert!(full_path.exists(), "'{}' does not exist", path.display());

    full_path
}

/// Returns the contents of a fixture.
///
/// # Panics
///
/// Panics if the fixture does not exist or cannot be read.
pub fn read_fixture(path: impl AsRef<Path>) -> Vec<u8> {
    std::fs::read(fixture(path)).unwrap()
}

/// Renders batch outcomes as `key: result` lines, for snapshots.
///
/// Successful loads show the payload size and content type.
pub fn describe_outcomes(outcomes: &PreloadOutcomes) -> String {
    let mut lines = Vec::with_capacity(outcomes.len());
    for (key, outcome) in outcomes {
        let line = match outcome {
            Ok(payload) => format!(
                "{key}: ok ({} bytes, {})",
                payload.len(),
                payload.content_type.as_deref().unwrap_or("unknown type")
            ),
            Err(err) => format!("{key}: {err}"),
        };
        lines.push(line);
    }
    lines.join("\n")
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A media server that counts how often each path was requested.
///
/// Routes:
///  - `/media/*path`: serves files from the `tests/fixtures/media` directory.
///  - `/delay/:time/*path`: waits for the given humantime duration, then redirects to `/path`.
///  - `/respond_statuscode/:num/*tail`: responds with the given status code.
///  - `/garbage_data/*tail`: responds with `tail` as body.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .nest_service("/media", ServeDir::new(fixture("media")))
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the number of requests since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests per path since the last call, and resets the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    failures: HashMap<String, PreloadError>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
}

/// A [`ResourceLoader`] that serves scripted results and records every call.
///
/// Every key loads successfully with the payload `loaded:<key>`, unless a failure was scripted
/// for it. Clones share their script and call log.
#[derive(Clone, Default)]
pub struct MockLoader {
    state: Arc<Mutex<MockState>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every load of `key` fail with `error`.
    pub fn fail(self, key: &str, error: PreloadError) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(key.to_owned(), error);
        self
    }

    /// Makes every load of `key` take `delay` before it resolves.
    pub fn delay(self, key: &str, delay: Duration) -> Self {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(key.to_owned(), delay);
        self
    }

    /// Makes loads of keys without their own delay take `delay`.
    pub fn default_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().default_delay = Some(delay);
        self
    }

    /// All keys that were loaded, in the order the loads were started.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// How often `key` was loaded.
    pub fn call_count(&self, key: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|call| *call == key).count()
    }
}

impl ResourceLoader for MockLoader {
    fn load(&self, request: &PreloadRequest) -> BoxFuture<'static, PreloadResult<Resource>> {
        let (failure, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(request.key.clone());
            let failure = state.failures.get(&request.key).cloned();
            let delay = state.delays.get(&request.key).copied().or(state.default_delay);
            (failure, delay)
        };
        let resource = Resource::new(request.kind.clone(), format!("loaded:{}", request.key));

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match failure {
                Some(error) => Err(error),
                None => Ok(resource),
            }
        }
        .boxed()
    }
}
