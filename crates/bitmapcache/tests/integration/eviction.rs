use std::time::Duration;

use crate::{CountingLoader, key, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_evicted_bitmap_is_loaded_again() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    let lease = cache
        .get_or_add(key("a"), |key| loader.load(key))
        .await
        .unwrap();
    drop(lease);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!cache.contains(&key("a")));
    assert_eq!(loader.disposals(), 1);

    let _lease = cache
        .get_or_add(key("a"), |key| loader.load(key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loader.calls_for("a"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout() {
    let cache = setup_cache(|config| config.idle_timeout = Some(Duration::ZERO));
    let loader = CountingLoader::new();

    let mut lease = cache.insert(key("a"), loader.bitmap("a"));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(cache.contains(&key("a")));

    lease.release();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(!cache.contains(&key("a")));
    assert_eq!(loader.disposals(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reacquire_restarts_idle_timeout() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    drop(cache.insert(key("a"), loader.bitmap("a")));
    tokio::time::sleep(Duration::from_secs(8)).await;

    drop(cache.get(&key("a")).unwrap());
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(cache.contains(&key("a")));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!cache.contains(&key("a")));
}

#[tokio::test(start_paused = true)]
async fn test_oldest_idle_evicted_first() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    drop(cache.insert(key("old"), loader.bitmap("old")));
    tokio::time::sleep(Duration::from_secs(5)).await;
    drop(cache.insert(key("new"), loader.bitmap("new")));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!cache.contains(&key("old")));
    assert!(cache.contains(&key("new")));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(cache.is_empty());
    assert_eq!(loader.disposals(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_eviction() {
    let cache = setup_cache(|config| config.idle_timeout = None);
    let loader = CountingLoader::new();

    drop(cache.insert(key("a"), loader.bitmap("a")));
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(cache.contains(&key("a")));

    // clearing still works
    assert_eq!(cache.clear(), 1);
    assert!(cache.is_empty());
    assert_eq!(loader.disposals(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clear() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    let leased = cache.insert(key("leased"), loader.bitmap("leased"));
    drop(cache.insert(key("a"), loader.bitmap("a")));
    drop(cache.insert(key("b"), loader.bitmap("b")));

    assert_eq!(cache.clear(), 2);
    assert_eq!(loader.disposals(), 2);
    assert_eq!(cache.len(), 1);
    assert!(leased.bitmap().is_some());

    assert_eq!(cache.clear(), 0);
    drop(leased);
    assert_eq!(cache.clear(), 1);
    assert_eq!(loader.disposals(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_eviction() {
    let cache = setup_cache(|config| config.idle_timeout = Some(Duration::ZERO));
    let loader = CountingLoader::new();

    cache.shutdown();
    assert!(cache.is_shut_down());

    drop(cache.insert(key("a"), loader.bitmap("a")));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(cache.contains(&key("a")));

    // explicit scans keep working
    assert_eq!(cache.evict_idle(), 1);
    assert_eq!(loader.disposals(), 1);

    cache.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_drop_frees_everything() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    let lease = cache.insert(key("a"), loader.bitmap("a"));
    drop(cache.insert(key("b"), loader.bitmap("b")));

    drop(cache);
    // let the eviction task notice the shutdown and release the store
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(loader.disposals(), 1);

    // the lease keeps its bitmap alive on its own
    assert_eq!(lease.bitmap().unwrap().key(), "a");
    drop(lease);
    assert_eq!(loader.disposals(), 2);
}
