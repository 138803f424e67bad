use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use serde::{Deserialize, Serialize};

use bitmapcache::{Bitmap, BitmapCache, LoadError};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// One kind of traffic hitting the cache.
///
/// Every request picks one of `keys` images at random, loads it through the cache, and holds on
/// to it for `hold_time` the way a control displays an image.
#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct images requested.
    pub keys: usize,
    /// How long fetching and decoding one image takes.
    #[serde(with = "humantime_serde", default)]
    pub load_latency: Duration,
    /// How long a request holds on to the image.
    #[serde(with = "humantime_serde", default)]
    pub hold_time: Duration,
    /// The share of loads that fail, between `0.0` and `1.0`.
    #[serde(default)]
    pub failure_rate: f64,
    /// The dimensions of the synthetic images.
    #[serde(default = "default_image_size")]
    pub image_size: (u32, u32),
}

fn default_image_size() -> (u32, u32) {
    (256, 256)
}

/// A decoded image that only pretends to hold pixels.
#[derive(Debug)]
pub struct SyntheticBitmap {
    size: (u32, u32),
    freed: Arc<AtomicUsize>,
}

impl Bitmap for SyntheticBitmap {
    fn pixel_size(&self) -> (u32, u32) {
        self.size
    }
}

impl Drop for SyntheticBitmap {
    fn drop(&mut self) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters shared by all loaders.
#[derive(Debug, Default)]
pub struct LoadStats {
    pub loads: AtomicUsize,
    pub failures: AtomicUsize,
    pub freed: Arc<AtomicUsize>,
}

/// A loader simulating slow and unreliable image sources.
#[derive(Debug, Clone)]
pub struct SyntheticLoader {
    latency: Duration,
    failure_rate: f64,
    image_size: (u32, u32),
    stats: Arc<LoadStats>,
}

impl SyntheticLoader {
    pub fn new(workload: &Workload, stats: Arc<LoadStats>) -> Self {
        Self {
            latency: workload.load_latency,
            failure_rate: match workload.failure_rate {
                rate if rate.is_nan() => 0.0,
                rate => rate.clamp(0.0, 1.0),
            },
            image_size: workload.image_size,
            stats,
        }
    }

    pub fn load(&self, key: String) -> BoxFuture<'static, anyhow::Result<Option<SyntheticBitmap>>> {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let fail = rand::rng().random_bool(self.failure_rate);
        let this = self.clone();

        async move {
            tokio::time::sleep(this.latency).await;
            if fail {
                this.stats.failures.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("simulated failure loading {key}");
            }
            Ok(Some(SyntheticBitmap {
                size: this.image_size,
                freed: Arc::clone(&this.stats.freed),
            }))
        }
        .boxed()
    }
}

/// A prepared workload, ready to issue requests.
#[derive(Debug)]
pub struct ParsedWorkload {
    pub concurrency: usize,
    keys: usize,
    hold_time: Duration,
    loader: SyntheticLoader,
}

pub fn prepare_workload(index: usize, workload: Workload, stats: Arc<LoadStats>) -> ParsedWorkload {
    let loader = SyntheticLoader::new(&workload, stats);
    tracing::debug!(index, ?workload, "Prepared workload");

    ParsedWorkload {
        concurrency: workload.concurrency.max(1),
        keys: workload.keys.max(1),
        hold_time: workload.hold_time,
        loader,
    }
}

/// Issues one request for a random image, and holds on to it.
pub async fn process_request(
    cache: &BitmapCache<String, SyntheticBitmap>,
    workload: &ParsedWorkload,
) -> Result<(), LoadError> {
    let index = rand::rng().random_range(0..workload.keys);
    let key = format!("image-{index}");

    let lease = cache
        .get_or_add(key, |key| workload.loader.load(key))
        .await?;

    if lease.is_some() {
        tokio::time::sleep(workload.hold_time).await;
    }
    Ok(())
}
