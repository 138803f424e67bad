//! Helpers for testing the bitmap cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Most tests should run on paused time (`#[tokio::test(start_paused = true)]`). The
//!    [`CountingLoader`] delay and the eviction interval are then driven by the runtime, and
//!    `tokio::time::sleep` or `tokio::time::advance` move idle entries past their timeout
//!    instantly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use bitmapcache::{Bitmap, LoadBitmap};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `bitmapcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("bitmapcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A fake decoded image that counts how often images were freed.
#[derive(Debug)]
pub struct TestBitmap {
    key: String,
    size: (u32, u32),
    disposals: Arc<AtomicUsize>,
}

impl TestBitmap {
    /// The key this bitmap was created for.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Bitmap for TestBitmap {
    fn pixel_size(&self) -> (u32, u32) {
        self.size
    }
}

impl Drop for TestBitmap {
    fn drop(&mut self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct LoaderState {
    calls: AtomicUsize,
    calls_by_key: Mutex<BTreeMap<String, usize>>,
    remaining_failures: AtomicUsize,
    disposals: Arc<AtomicUsize>,
}

/// A loader producing [`TestBitmap`]s, keeping count of what it was asked to do.
///
/// - Every call is counted right when the loader is called, before the returned future runs.
/// - Loads take [`with_delay`](Self::with_delay) to finish. There is no delay by default.
/// - Keys starting with `missing` produce no bitmap.
/// - After [`fail_next`](Self::fail_next), the next calls fail.
///
/// Clones share their counters.
#[derive(Debug, Clone)]
pub struct CountingLoader {
    delay: Duration,
    size: (u32, u32),
    state: Arc<LoaderState>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            size: (64, 32),
            state: Default::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next(&self, count: usize) {
        self.state.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// The total number of calls.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// The number of calls for `key`.
    pub fn calls_for(&self, key: &str) -> usize {
        let calls = self.state.calls_by_key.lock().unwrap();
        calls.get(key).copied().unwrap_or_default()
    }

    /// The number of bitmaps created by this loader that have been freed.
    pub fn disposals(&self) -> usize {
        self.state.disposals.load(Ordering::SeqCst)
    }

    /// Creates a bitmap right away, without counting it as a call.
    pub fn bitmap(&self, key: &str) -> TestBitmap {
        TestBitmap {
            key: key.to_owned(),
            size: self.size,
            disposals: Arc::clone(&self.state.disposals),
        }
    }

    /// Starts loading the bitmap for `key`.
    pub fn load(&self, key: String) -> BoxFuture<'static, anyhow::Result<Option<TestBitmap>>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .state
            .calls_by_key
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default() += 1;

        let fail = self
            .state
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let this = self.clone();

        async move {
            if !this.delay.is_zero() {
                tokio::time::sleep(this.delay).await;
            }
            if fail {
                anyhow::bail!("failed to fetch {key}");
            }
            if key.starts_with("missing") {
                return Ok(None);
            }
            Ok(Some(this.bitmap(&key)))
        }
        .boxed()
    }
}

impl Default for CountingLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBitmap<String, TestBitmap> for CountingLoader {
    fn load(&self, key: String) -> BoxFuture<'static, anyhow::Result<Option<TestBitmap>>> {
        CountingLoader::load(self, key)
    }
}
