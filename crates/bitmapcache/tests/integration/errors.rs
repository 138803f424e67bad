use std::panic::AssertUnwindSafe;
use std::time::Duration;

use bitmapcache::LoadError;
use futures::FutureExt;
use futures::future::{self, Ready};

use crate::{CountingLoader, TestBitmap, key, setup_cache};

fn crash_decoder() -> anyhow::Result<Option<TestBitmap>> {
    panic!("decoder crashed");
}

fn reject_url(key: String) -> Ready<anyhow::Result<Option<TestBitmap>>> {
    panic!("invalid image url: {key}");
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_shared_and_not_cached() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_delay(Duration::from_millis(20));
    loader.fail_next(1);

    let (first, second) = futures::join!(
        cache.get_or_add(key("a"), |key| loader.load(key)),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cache.get_or_add(key("a"), |key| loader.load(key)).await
        },
    );

    let first = first.unwrap_err();
    let second = second.unwrap_err();
    assert!(matches!(first, LoadError::Failed(_)));
    assert_eq!(first.to_string(), "failed to load bitmap: failed to fetch a");
    assert_eq!(first.to_string(), second.to_string());

    assert_eq!(loader.calls(), 1);
    assert!(cache.is_empty());
    assert_eq!(cache.pending_loads(), 0);

    // the next request starts over
    let lease = cache
        .get_or_add(key("a"), |key| loader.load(key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loader.calls(), 2);
    assert_eq!(lease.bitmap().unwrap().key(), "a");
    assert_eq!(cache.refcount(&key("a")), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_missing_bitmap() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    let lease = cache
        .get_or_add(key("missing-a"), |key| loader.load(key))
        .await
        .unwrap();
    assert!(lease.is_none());
    assert!(cache.is_empty());
    assert_eq!(cache.pending_loads(), 0);

    // nothing is remembered about missing bitmaps either
    let lease = cache
        .get_or_add(key("missing-a"), |key| loader.load(key))
        .await
        .unwrap();
    assert!(lease.is_none());
    assert_eq!(loader.calls_for("missing-a"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_loader() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    let result = cache
        .get_or_add(key("a"), |_| async { crash_decoder() })
        .await;
    assert!(matches!(result, Err(LoadError::Cancelled)));
    assert_eq!(cache.pending_loads(), 0);
    assert!(cache.is_empty());

    let lease = cache
        .get_or_add(key("a"), |key| loader.load(key))
        .await
        .unwrap();
    assert!(lease.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_loader_fails_all_waiters() {
    let cache = setup_cache(|_| {});

    let (first, second) = futures::join!(
        cache.get_or_add(key("a"), |_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            crash_decoder()
        }),
        cache.get_or_add(key("a"), |_| async { crash_decoder() }),
    );
    assert!(matches!(first, Err(LoadError::Cancelled)));
    assert!(matches!(second, Err(LoadError::Cancelled)));
    assert_eq!(cache.pending_loads(), 0);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_loader_panicking_before_load_starts() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    let result = AssertUnwindSafe(cache.get_or_add(key("bad"), reject_url))
        .catch_unwind()
        .await;
    assert!(result.is_err());
    assert_eq!(cache.pending_loads(), 0);

    // the cache keeps working, for other keys and the same one
    let other = cache
        .get_or_add(key("other"), |key| loader.load(key))
        .await
        .unwrap();
    assert!(other.is_some());

    let bad = cache
        .get_or_add(key("bad"), |key| future::ready(Ok(Some(loader.bitmap(&key)))))
        .await
        .unwrap();
    assert_eq!(bad.unwrap().bitmap().unwrap().key(), "bad");
    assert_eq!(cache.len(), 2);
}
