use std::time::Duration;

use futures::future::join_all;

use crate::{CountingLoader, key, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_overlapping_requests_share_one_load() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_delay(Duration::from_millis(50));

    let first = cache.get_or_add(key("a"), |key| loader.load(key));
    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.get_or_add(key("a"), |key| loader.load(key)).await
    };
    let (first, second) = futures::join!(first, second);
    let mut first = first.unwrap().unwrap();
    let mut second = second.unwrap().unwrap();

    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.refcount(&key("a")), Some(2));
    assert_eq!(cache.pending_loads(), 0);
    assert!(std::ptr::eq(
        first.bitmap().unwrap(),
        second.bitmap().unwrap()
    ));

    first.release();
    assert_eq!(cache.refcount(&key("a")), Some(1));

    // still displayed by the second control
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(cache.contains(&key("a")));
    assert_eq!(loader.disposals(), 0);

    second.release();
    assert_eq!(cache.refcount(&key("a")), Some(0));

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!cache.contains(&key("a")));
    assert_eq!(loader.disposals(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_many_concurrent_requests() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));

    let requests = (0..16).map(|_| cache.get_or_add(key("a"), |key| loader.load(key)));
    let leases: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|lease| lease.unwrap().unwrap())
        .collect();

    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.refcount(&key("a")), Some(16));
    assert!(
        leases
            .iter()
            .all(|lease| lease.bitmap().unwrap().key() == "a")
    );

    drop(leases);
    assert_eq!(cache.refcount(&key("a")), Some(0));
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_keys_load_independently() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_delay(Duration::from_millis(50));

    let (a, b) = futures::join!(
        cache.get_or_add(key("a"), |key| loader.load(key)),
        cache.get_or_add(key("b"), |key| loader.load(key)),
    );

    assert_eq!(a.unwrap().unwrap().bitmap().unwrap().key(), "a");
    assert_eq!(b.unwrap().unwrap().bitmap().unwrap().key(), "b");
    assert_eq!(loader.calls_for("a"), 1);
    assert_eq!(loader.calls_for("b"), 1);
    assert_eq!(cache.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_request_keeps_load_running() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        cache.get_or_add(key("a"), |key| loader.load(key)),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(cache.pending_loads(), 1);

    let lease = cache
        .get_or_add(key("a"), |key| loader.load(key))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.pending_loads(), 0);
    assert_eq!(cache.refcount(&key("a")), Some(1));
    assert!(lease.bitmap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_load_completes_without_requests() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_delay(Duration::from_millis(100));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        cache.get_or_add(key("a"), |key| loader.load(key)),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;

    // nobody holds the bitmap, but it stays cached until evicted
    assert_eq!(cache.pending_loads(), 0);
    assert_eq!(cache.refcount(&key("a")), Some(0));
    assert_eq!(loader.disposals(), 0);

    let _lease = cache
        .get_or_add(key("a"), |key| loader.load(key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loader.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_insert_during_load() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_delay(Duration::from_millis(50));

    let loading = cache.get_or_add(key("a"), |key| loader.load(key));
    let seeding = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.insert(key("a"), loader.bitmap("a"))
    };
    let (loaded, seeded) = futures::join!(loading, seeding);
    let loaded = loaded.unwrap().unwrap();

    // the seeded bitmap was first, the loaded one is freed right away
    assert_eq!(loader.disposals(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.refcount(&key("a")), Some(2));
    assert!(std::ptr::eq(
        loaded.bitmap().unwrap(),
        seeded.bitmap().unwrap()
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_from_many_threads() {
    let cache = std::sync::Arc::new(setup_cache(|config| config.idle_timeout = None));
    let loader = CountingLoader::new().with_delay(Duration::from_millis(20));

    let tasks = (0..8).map(|_| {
        let cache = std::sync::Arc::clone(&cache);
        let loader = loader.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let lease = cache
                    .get_or_add(key("shared"), |key| loader.load(key))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(lease.bitmap().unwrap().key(), "shared");
                tokio::task::yield_now().await;
            }
        })
    });
    for task in join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.refcount(&key("shared")), Some(0));
    assert_eq!(cache.pending_loads(), 0);
}
