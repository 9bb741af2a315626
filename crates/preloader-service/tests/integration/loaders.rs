use std::time::Duration;

use preloader_service::caching::PreloadError;
use preloader_service::config::{Config, LoaderConfig};
use preloader_service::download::{Loaders, ResourceLoader};
use preloader_service::preload::Preloader;
use preloader_service::types::{PreloadRequest, ResourceKind};
use preloader_test as test;
use url::Url;

use crate::{HitCounter, describe_outcomes, fixture, read_fixture};

fn loaders(update_config: impl FnOnce(&mut LoaderConfig)) -> Loaders {
    test::setup();
    let mut config = LoaderConfig::default();
    update_config(&mut config);
    Loaders::from_config(&config).unwrap()
}

fn request(key: impl Into<String>, kind: ResourceKind) -> PreloadRequest {
    PreloadRequest::new(key, 1, kind)
}

#[tokio::test]
async fn test_http_load() {
    let server = HitCounter::new();
    let loaders = loaders(|_| {});

    let url = server.url("media/logo.png");
    let resource = loaders
        .load(&request(url, ResourceKind::Image))
        .await
        .unwrap();

    assert_eq!(&resource.data[..], read_fixture("media/logo.png"));
    assert_eq!(resource.content_type.as_deref(), Some("image/png"));
    assert_eq!(resource.kind, ResourceKind::Image);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_http_status_codes() {
    let server = HitCounter::new();
    let loaders = loaders(|_| {});

    let missing = server.url("respond_statuscode/404/logo.png");
    let error = loaders
        .load(&request(missing, ResourceKind::Image))
        .await
        .unwrap_err();
    assert_eq!(error, PreloadError::NotFound);

    let gone = server.url("respond_statuscode/410/logo.png");
    let error = loaders
        .load(&request(gone, ResourceKind::Image))
        .await
        .unwrap_err();
    assert_eq!(error, PreloadError::NotFound);

    let broken = server.url("respond_statuscode/500/logo.png");
    let error = loaders
        .load(&request(broken, ResourceKind::Image))
        .await
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        "load failed: unexpected status 500 Internal Server Error"
    );

    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_http_timeout() {
    let server = HitCounter::new();
    let loaders = loaders(|config| config.load_timeout = Duration::from_millis(100));

    let slow = server.url("delay/2s/media/logo.png");
    let error = loaders
        .load(&request(slow, ResourceKind::Image))
        .await
        .unwrap_err();

    assert_eq!(error, PreloadError::Timeout(Duration::from_millis(100)));
}

#[tokio::test]
async fn test_http_follows_redirects() {
    let server = HitCounter::new();
    let loaders = loaders(|_| {});

    let delayed = server.url("delay/10ms/media/clip.webm");
    let resource = loaders
        .load(&request(delayed, ResourceKind::Video))
        .await
        .unwrap();

    assert_eq!(&resource.data[..], read_fixture("media/clip.webm"));
    assert_eq!(
        server.all_hits(),
        [
            ("/delay/10ms/media/clip.webm".to_owned(), 1),
            ("/media/clip.webm".to_owned(), 1),
        ]
    );
}

#[tokio::test]
async fn test_preload_over_http() {
    let server = HitCounter::new();
    let loaders = loaders(|_| {});
    let mut config = Config::default();
    config.preload.max_concurrent_loads = 2;
    let preloader = Preloader::new(&config, loaders).unwrap();

    let key = |path: &str| server.url(path).to_string();
    let requests = [
        PreloadRequest::from_attributes(key("media/logo.png"), Some("1"), "image"),
        PreloadRequest::from_attributes(key("media/intro.mp3"), Some("2"), "audio"),
        PreloadRequest::from_attributes(key("garbage_data/hello"), None, "image"),
        PreloadRequest::from_attributes(key("respond_statuscode/404/a.png"), Some("3"), "img"),
    ];

    let outcomes = preloader.preload_all(requests.clone()).await;
    let port = server.url("/").port().unwrap_or_default();
    let listing = describe_outcomes(&outcomes).replace(&port.to_string(), "<port>");

    insta::assert_snapshot!(listing, @r###"
    http://localhost:<port>/garbage_data/hello: ok (5 bytes, text/plain; charset=utf-8)
    http://localhost:<port>/media/intro.mp3: ok (22 bytes, audio/mpeg)
    http://localhost:<port>/media/logo.png: ok (40 bytes, image/png)
    http://localhost:<port>/respond_statuscode/404/a.png: not found
    "###);
    assert_eq!(server.accesses(), 4);

    // everything that loaded is served from the cache now
    let outcomes = preloader.preload_all(requests).await;
    assert_eq!(outcomes.len(), 4);
    assert_eq!(server.accesses(), 1);
    assert_eq!(preloader.cache().size(), 3);
}

#[tokio::test]
async fn test_filesystem_relative_path() {
    let loaders = loaders(|config| config.base_dir = Some(fixture("media")));

    let resource = loaders
        .load(&request("intro.mp3", ResourceKind::Audio))
        .await
        .unwrap();

    assert_eq!(&resource.data[..], read_fixture("media/intro.mp3"));
    assert_eq!(resource.content_type.as_deref(), Some("audio/mpeg"));
}

#[tokio::test]
async fn test_filesystem_file_url() {
    let loaders = loaders(|_| {});

    let url = Url::from_file_path(fixture("media/clip.webm")).unwrap();
    let resource = loaders
        .load(&request(url, ResourceKind::Video))
        .await
        .unwrap();

    assert_eq!(&resource.data[..], read_fixture("media/clip.webm"));
    assert_eq!(resource.content_type.as_deref(), Some("video/webm"));
}

#[tokio::test]
async fn test_filesystem_missing_file() {
    let media_dir = test::tempdir();
    let loaders = loaders(|config| config.base_dir = Some(media_dir.path().to_owned()));

    let error = loaders
        .load(&request("missing.png", ResourceKind::Image))
        .await
        .unwrap_err();
    assert_eq!(error, PreloadError::NotFound);

    std::fs::write(media_dir.path().join("notes.txt"), b"hello").unwrap();
    let resource = loaders
        .load(&request("notes.txt", ResourceKind::Image))
        .await
        .unwrap();
    assert_eq!(&resource.data[..], b"hello");
    assert_eq!(resource.content_type, None);
}

#[tokio::test]
async fn test_custom_loader_for_kind() {
    let mock = test::MockLoader::new();
    let loaders = loaders(|_| {}).with(ResourceKind::Unknown("font".into()), mock.clone());

    let resource = loaders
        .load(&request("fonts/a.woff2", ResourceKind::from("font")))
        .await
        .unwrap();

    assert_eq!(&resource.data[..], b"loaded:fonts/a.woff2");
    assert_eq!(mock.calls(), ["fonts/a.woff2"]);
    assert!(mock.load(&request("x", ResourceKind::Image)).await.is_ok());
}
