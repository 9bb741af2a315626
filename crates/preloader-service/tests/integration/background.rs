use std::sync::Arc;
use std::time::Duration;

use preloader_service::caching::FixedMemory;
use tokio::time::sleep;

use crate::{MockLoader, image, setup_preloader};

#[tokio::test(start_paused = true)]
async fn test_reaper_expires_entries() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |config| {
        config.cache.cache_duration = Duration::from_secs(60);
        config.cache.reap_interval = Duration::from_secs(30);
        config.capacity_adapter.enabled = false;
    });
    let _tasks = preloader.start_background_tasks(Arc::new(FixedMemory::new(None)));

    preloader.preload_all([image("a", 1)]).await;

    // exactly as old as the cache duration at the second sweep, which keeps it
    sleep(Duration::from_secs(61)).await;
    assert!(preloader.cache().has("a"));

    sleep(Duration::from_secs(30)).await;
    assert!(!preloader.cache().has("a"));

    // a shorter duration applies to the next sweep
    preloader.preload_all([image("b", 1)]).await;
    preloader.set_cache_duration(Duration::from_secs(10)).unwrap();
    sleep(Duration::from_secs(30)).await;
    assert!(!preloader.cache().has("b"));
    assert_eq!(preloader.cache().stats().expirations, 2);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_follows_memory_pressure() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |config| {
        config.cache.capacity = 50;
        config.capacity_adapter.interval = Duration::from_secs(600);
    });
    let memory = Arc::new(FixedMemory::new(Some(100)));
    let tasks = preloader.start_background_tasks(memory.clone());

    sleep(Duration::from_secs(601)).await;
    assert_eq!(preloader.cache().capacity(), 45);

    memory.set(Some(4096));
    sleep(Duration::from_secs(600)).await;
    assert_eq!(preloader.cache().capacity(), 50);

    // the signal is ignored while it is unavailable
    memory.set(None);
    sleep(Duration::from_secs(600)).await;
    assert_eq!(preloader.cache().capacity(), 50);

    tasks.stop().await;
    memory.set(Some(100));
    sleep(Duration::from_secs(1200)).await;
    assert_eq!(preloader.cache().capacity(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_shrink_evicts() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |config| {
        config.cache.capacity = 20;
        config.capacity_adapter.interval = Duration::from_secs(60);
    });

    let requests = (0..20).map(|i| image(&format!("key-{i:02}"), i));
    preloader.preload_all(requests).await;
    assert_eq!(preloader.cache().size(), 20);

    let _tasks = preloader.start_background_tasks(Arc::new(FixedMemory::new(Some(1))));
    sleep(Duration::from_secs(61)).await;

    let cache = preloader.cache();
    assert_eq!(cache.capacity(), 18);
    assert_eq!(cache.size(), 18);
    assert!(!cache.has("key-00"));
    assert!(!cache.has("key-01"));
    assert!(cache.has("key-02"));
}

#[tokio::test(start_paused = true)]
async fn test_adapter_disabled() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |config| config.capacity_adapter.enabled = false);
    let _tasks = preloader.start_background_tasks(Arc::new(FixedMemory::new(Some(1))));

    sleep(Duration::from_secs(3600)).await;
    assert_eq!(preloader.cache().capacity(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_background_tasks() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |_| {});
    let memory = Arc::new(FixedMemory::new(Some(1)));
    let _tasks = preloader.start_background_tasks(memory.clone());

    preloader.shutdown();
    sleep(Duration::from_secs(3600)).await;
    assert_eq!(preloader.cache().capacity(), 50);
}
