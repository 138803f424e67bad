use std::time::Duration;

use bitmapcache::BitmapCache;
use bitmapcache::config::CacheConfig;
use bitmapcache_test as test;

pub use test::{CountingLoader, TestBitmap};

pub type TestCache = BitmapCache<String, TestBitmap>;

/// Setup tests and create a cache to test.
///
/// The cache scans for idle bitmaps every second and evicts them after ten seconds. The
/// `update_config` closure can change the configuration before the cache is created.
pub fn setup_cache(update_config: impl FnOnce(&mut CacheConfig)) -> TestCache {
    test::setup();

    let mut config = CacheConfig {
        eviction_interval: Duration::from_secs(1),
        idle_timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    update_config(&mut config);

    BitmapCache::new(&config)
}

pub fn key(key: &str) -> String {
    key.to_owned()
}
