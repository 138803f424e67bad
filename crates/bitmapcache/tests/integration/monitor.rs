use std::time::Duration;

use crate::{CountingLoader, key, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_monitor_reports_cache_contents() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new();

    let _displayed = cache.insert(key("displayed"), loader.bitmap("displayed"));
    let _shared = cache.get(&key("displayed")).unwrap();
    drop(cache.insert(key("hidden"), loader.bitmap("hidden")));

    let monitor = cache.monitor(Duration::from_secs(2));
    let mut snapshots = monitor.subscribe();
    monitor.start();

    snapshots.changed().await.unwrap();
    let snapshot = snapshots.borrow_and_update().clone();

    let items: Vec<_> = snapshot
        .items
        .iter()
        .map(|item| (item.key.as_str(), item.state.refcount, item.formatted_size()))
        .collect();
    insta::assert_debug_snapshot!(items, @r###"
    [
        (
            "hidden",
            0,
            "0.01 MB",
        ),
        (
            "displayed",
            2,
            "0.01 MB",
        ),
    ]
    "###);
    assert_eq!(snapshot.total_estimated_bytes, 2 * 64 * 32 * 4);
    assert_eq!(snapshot.formatted_size(), "0.02 MB");
    assert_eq!(snapshot.referenced(), 1);

    // evictions show up in the next snapshot
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(!cache.contains(&key("hidden")));
    snapshots.mark_unchanged();
    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow_and_update().items.len(), 1);

    monitor.stop();
    assert!(!monitor.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_monitor_reports_loaded_sizes() {
    let cache = setup_cache(|_| {});
    let loader = CountingLoader::new().with_size(1024, 256);

    let _lease = cache
        .get_or_add(key("large"), |key| loader.load(key))
        .await
        .unwrap()
        .unwrap();

    let monitor = cache.monitor(Duration::from_secs(2));
    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.total_estimated_bytes, 1024 * 1024);
    assert_eq!(snapshot.formatted_size(), "1.00 MB");
    assert_eq!(snapshot.items[0].formatted_size(), "1.00 MB");
    assert_eq!(snapshot.referenced(), 1);
}
