use preloader_service::config::Config;
use preloader_service::download::Loaders;
use preloader_service::preload::{LoadState, Preloader};
use preloader_service::types::{PreloadRequest, ResourceKind};
use preloader_test as test;

pub use test::{HitCounter, MockLoader, describe_outcomes, fixture, read_fixture};

/// Setup tests and create a preloader that loads images, audio and video with `loader`.
///
/// The `update_config` closure can modify the default configuration before the preloader is
/// created.
pub fn setup_preloader(loader: &MockLoader, update_config: impl FnOnce(&mut Config)) -> Preloader {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let loaders = Loaders::new()
        .with(ResourceKind::Image, loader.clone())
        .with(ResourceKind::Audio, loader.clone())
        .with(ResourceKind::Video, loader.clone());
    Preloader::new(&config, loaders).unwrap()
}

pub fn image(key: &str, priority: u32) -> PreloadRequest {
    PreloadRequest::new(key, priority, ResourceKind::Image)
}

/// Yields to the runtime until the pending load for `key` reaches `state`.
///
/// # Panics
///
/// Panics if the state is not reached after a bounded number of yields.
pub async fn wait_for_state(preloader: &Preloader, key: &str, state: LoadState) {
    for _ in 0..100 {
        if preloader.pending_state(key) == Some(state) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("`{key}` never reached {state:?}");
}

/// Yields to the runtime a few times, so that spawned tasks make progress.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
