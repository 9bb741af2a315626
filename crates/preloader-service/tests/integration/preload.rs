use std::sync::Arc;
use std::time::Duration;

use preloader_service::caching::PreloadError;
use preloader_service::preload::LoadState;
use preloader_service::types::{PreloadRequest, Priority, ResourceKind};
use tokio::time::Instant;

use crate::{MockLoader, describe_outcomes, image, settle, setup_preloader, wait_for_state};

#[tokio::test(start_paused = true)]
async fn test_single_flight_across_batches() {
    let loader = MockLoader::new().delay("a", Duration::from_millis(100));
    let preloader = setup_preloader(&loader, |_| {});

    let (first, second) = tokio::join!(
        preloader.preload_all([image("a", 1)]),
        preloader.preload_all([image("a", 1)]),
    );

    assert_eq!(loader.call_count("a"), 1);
    let first = first["a"].as_ref().unwrap();
    let second = second["a"].as_ref().unwrap();
    assert!(Arc::ptr_eq(first, second));
    assert_eq!(&first.data[..], b"loaded:a");
    assert_eq!(preloader.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_joined_failure_is_shared() {
    let loader = MockLoader::new()
        .delay("a", Duration::from_millis(100))
        .fail("a", PreloadError::NotFound);
    let preloader = setup_preloader(&loader, |_| {});

    let (first, second) = tokio::join!(
        preloader.preload_all([image("a", 1)]),
        preloader.preload_all([image("a", 1), image("b", 2)]),
    );

    assert_eq!(loader.call_count("a"), 1);
    assert_eq!(first["a"], Err(PreloadError::NotFound));
    assert_eq!(second["a"], Err(PreloadError::NotFound));
    assert!(second["b"].is_ok());
    assert!(!preloader.cache().has("a"));

    // failures are not cached, the next request loads again
    preloader.preload_all([image("a", 1)]).await;
    assert_eq!(loader.call_count("a"), 2);
}

#[tokio::test]
async fn test_loads_in_priority_order() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |_| {});

    let outcomes = preloader
        .preload_all([image("p5", 5), image("p1", 1), image("p3", 3)])
        .await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(loader.calls(), ["p1", "p3", "p5"]);
}

#[tokio::test]
async fn test_equal_priorities_keep_request_order() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |_| {});

    let missing = PreloadRequest::from_attributes("none", None, "image");
    preloader
        .preload_all([missing, image("a", 2), image("b", 2), image("c", 1)])
        .await;

    assert_eq!(loader.calls(), ["c", "a", "b", "none"]);
    assert_eq!(preloader.cache().get("none").unwrap().priority, Priority::NONE);
}

#[tokio::test]
async fn test_partial_failure() {
    let loader = MockLoader::new().fail("r3", PreloadError::NotFound);
    let preloader = setup_preloader(&loader, |_| {});

    let requests = (1..=5).map(|i| image(&format!("r{i}"), i));
    let outcomes = preloader.preload_all(requests).await;

    insta::assert_snapshot!(describe_outcomes(&outcomes), @r###"
    r1: ok (9 bytes, unknown type)
    r2: ok (9 bytes, unknown type)
    r3: not found
    r4: ok (9 bytes, unknown type)
    r5: ok (9 bytes, unknown type)
    "###);

    assert_eq!(preloader.cache().size(), 4);
    assert!(!preloader.cache().has("r3"));
    assert_eq!(preloader.pending_len(), 0);
}

#[tokio::test]
async fn test_mixed_kinds() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |_| {});

    let outcomes = preloader
        .preload_all([
            PreloadRequest::from_attributes("song", Some("2"), "audio"),
            PreloadRequest::from_attributes("clip", Some("1"), "video"),
            PreloadRequest::from_attributes("frame", Some("3"), "iframe"),
        ])
        .await;

    insta::assert_snapshot!(describe_outcomes(&outcomes), @r###"
    clip: ok (11 bytes, unknown type)
    frame: no loader registered for `iframe` resources
    song: ok (11 bytes, unknown type)
    "###);
    assert_eq!(loader.calls(), ["clip", "song"]);
    assert_eq!(preloader.cache().get("song").unwrap().payload.kind, ResourceKind::Audio);
}

#[tokio::test]
async fn test_evicts_earliest_inserted() {
    let loader = MockLoader::new();
    let preloader = setup_preloader(&loader, |config| config.cache.capacity = 2);

    let outcomes = preloader
        .preload_all([image("A", 1), image("B", 2), image("C", 3)])
        .await;

    assert!(outcomes.values().all(Result::is_ok));
    let cache = preloader.cache();
    assert_eq!(cache.size(), 2);
    assert!(!cache.has("A"));
    assert!(cache.has("B"));
    assert!(cache.has("C"));

    // A is gone from the cache and is loaded again
    preloader.preload_all([image("A", 1)]).await;
    assert_eq!(loader.call_count("A"), 2);
    assert!(!cache.has("B"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_load() {
    let loader = MockLoader::new().default_delay(Duration::from_millis(100));
    let preloader = setup_preloader(&loader, |_| {});

    let batch = tokio::spawn({
        let preloader = preloader.clone();
        async move { preloader.preload_all([image("a", 1), image("b", 2)]).await }
    });

    wait_for_state(&preloader, "a", LoadState::Loading).await;
    assert_eq!(preloader.pending_state("b"), Some(LoadState::Queued));

    assert!(preloader.cancel("b"));
    assert!(!preloader.cancel("b"));
    assert!(!preloader.cancel("unknown"));

    let outcomes = batch.await.unwrap();
    assert!(outcomes["a"].is_ok());
    assert_eq!(outcomes["b"], Err(PreloadError::Cancelled));
    assert_eq!(loader.calls(), ["a"]);
    assert!(preloader.cache().has("a"));
    assert!(!preloader.cache().has("b"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_load() {
    let loader = MockLoader::new().default_delay(Duration::from_millis(100));
    let preloader = setup_preloader(&loader, |_| {});

    let batch = tokio::spawn({
        let preloader = preloader.clone();
        async move { preloader.preload_all([image("a", 1), image("b", 2)]).await }
    });

    wait_for_state(&preloader, "a", LoadState::Loading).await;
    assert!(preloader.cancel("a"));

    let outcomes = batch.await.unwrap();
    assert_eq!(outcomes["a"], Err(PreloadError::Cancelled));
    assert!(outcomes["b"].is_ok());
    assert!(!preloader.cache().has("a"));

    // a cancelled key starts over on the next request
    let outcomes = preloader.preload_all([image("a", 1)]).await;
    assert!(outcomes["a"].is_ok());
    assert_eq!(loader.call_count("a"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_batch_hands_queued_loads_to_joiners() {
    let loader = MockLoader::new().default_delay(Duration::from_millis(100));
    let preloader = setup_preloader(&loader, |_| {});

    let batch = tokio::spawn({
        let preloader = preloader.clone();
        async move { preloader.preload_all([image("a", 1), image("b", 2)]).await }
    });
    wait_for_state(&preloader, "a", LoadState::Loading).await;

    let joiner = tokio::spawn({
        let preloader = preloader.clone();
        async move { preloader.preload_all([image("b", 1)]).await }
    });
    settle().await;
    assert_eq!(loader.calls(), ["a"]);

    batch.abort();
    assert!(batch.await.unwrap_err().is_cancelled());

    // the joiner loads `b` itself instead of failing
    let outcomes = joiner.await.unwrap();
    assert_eq!(&outcomes["b"].as_ref().unwrap().data[..], b"loaded:b");
    assert!(preloader.cache().has("b"));

    // the load that was already running completes on its own
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(preloader.cache().has("a"));
    assert_eq!(loader.calls(), ["a", "b"]);
    assert_eq!(preloader.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_load_is_taken_over_once() {
    let loader = MockLoader::new().default_delay(Duration::from_millis(100));
    let preloader = setup_preloader(&loader, |_| {});

    let batch = tokio::spawn({
        let preloader = preloader.clone();
        async move { preloader.preload_all([image("a", 1), image("b", 2)]).await }
    });
    wait_for_state(&preloader, "a", LoadState::Loading).await;

    let joiners: Vec<_> = (0..3)
        .map(|_| {
            let preloader = preloader.clone();
            tokio::spawn(async move { preloader.preload_all([image("b", 5)]).await })
        })
        .collect();
    settle().await;

    batch.abort();
    for joiner in joiners {
        let outcomes = joiner.await.unwrap();
        assert!(outcomes["b"].is_ok());
    }
    assert_eq!(loader.call_count("b"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads() {
    let loader = MockLoader::new().default_delay(Duration::from_millis(100));
    let preloader = setup_preloader(&loader, |config| config.preload.max_concurrent_loads = 3);

    let started = Instant::now();
    let requests = (1..=6).map(|i| image(&format!("r{i}"), i));
    let outcomes = preloader.preload_all(requests).await;
    let elapsed = started.elapsed();

    assert!(outcomes.values().all(Result::is_ok));
    assert_eq!(loader.calls(), ["r1", "r2", "r3", "r4", "r5", "r6"]);
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown() {
    let loader = MockLoader::new().delay("slow", Duration::from_secs(10));
    let preloader = setup_preloader(&loader, |_| {});

    preloader.preload_all([image("cached", 1)]).await;
    assert!(preloader.cache().has("cached"));

    let batch = tokio::spawn({
        let preloader = preloader.clone();
        async move {
            preloader
                .preload_all([image("slow", 1), image("queued", 2)])
                .await
        }
    });
    wait_for_state(&preloader, "slow", LoadState::Loading).await;

    preloader.shutdown();

    let outcomes = batch.await.unwrap();
    assert_eq!(outcomes["slow"], Err(PreloadError::Cancelled));
    assert_eq!(outcomes["queued"], Err(PreloadError::Cancelled));
    assert_eq!(loader.call_count("queued"), 0);
    assert_eq!(preloader.cache().size(), 0);
    assert_eq!(preloader.pending_len(), 0);
}
