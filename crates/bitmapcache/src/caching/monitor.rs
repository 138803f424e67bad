use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Bitmap, BitmapKey, BitmapStore, EntryInfo};

/// Renders a byte count in megabytes, for example `"1.50 MB"`.
pub fn format_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
}

impl<K> EntryInfo<K> {
    /// The estimated size of the bitmap, see [`format_size`].
    pub fn formatted_size(&self) -> String {
        format_size(self.state.estimated_bytes)
    }
}

/// The contents of a [`BitmapStore`] at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot<K> {
    /// All entries, in the order they would be considered for eviction.
    pub items: Vec<EntryInfo<K>>,
    pub total_estimated_bytes: u64,
}

impl<K> StoreSnapshot<K> {
    fn new(items: Vec<EntryInfo<K>>) -> Self {
        let total_estimated_bytes = items.iter().map(|item| item.state.estimated_bytes).sum();
        Self {
            items,
            total_estimated_bytes,
        }
    }

    /// The number of entries that are currently leased.
    pub fn referenced(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.state.refcount > 0)
            .count()
    }

    /// The total estimated size, see [`format_size`].
    pub fn formatted_size(&self) -> String {
        format_size(self.total_estimated_bytes)
    }
}

impl<K> Default for StoreSnapshot<K> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total_estimated_bytes: 0,
        }
    }
}

type SnapshotSender<K> = Arc<watch::Sender<Arc<StoreSnapshot<K>>>>;

/// Periodically publishes [`StoreSnapshot`]s of a store, for diagnostics.
///
/// The monitor only ever reads the store. Snapshots are published right after
/// [`start`](Self::start) and then once per interval, until the monitor is stopped or dropped.
pub struct StoreMonitor<K: BitmapKey, T: Bitmap> {
    store: Arc<BitmapStore<K, T>>,
    interval: Duration,
    sender: SnapshotSender<K>,
    running: Mutex<Option<CancellationToken>>,
}

impl<K: BitmapKey, T: Bitmap> StoreMonitor<K, T> {
    pub fn new(store: Arc<BitmapStore<K, T>>, interval: Duration) -> Self {
        let (sender, _) = watch::channel(Arc::new(StoreSnapshot::default()));
        Self {
            store,
            interval: interval.max(Duration::from_millis(1)),
            sender: Arc::new(sender),
            running: Mutex::new(None),
        }
    }

    /// Starts publishing snapshots. Does nothing if the monitor is already running.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let task = publish_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.sender),
            self.interval,
            token.clone(),
        );
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        tracing::debug!(interval = ?self.interval, "Started bitmap store monitor");
        *running = Some(token);
    }

    /// Stops publishing snapshots. Does nothing if the monitor is not running.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().unwrap().take() {
            token.cancel();
            tracing::debug!("Stopped bitmap store monitor");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    /// Subscribes to published snapshots.
    ///
    /// The receiver starts out with the most recently published snapshot marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot<K>>> {
        self.sender.subscribe()
    }

    /// Takes a snapshot right now, without publishing it.
    pub fn snapshot(&self) -> StoreSnapshot<K> {
        StoreSnapshot::new(self.store.snapshot())
    }
}

impl<K: BitmapKey, T: Bitmap> Drop for StoreMonitor<K, T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<K: BitmapKey, T: Bitmap> fmt::Debug for StoreMonitor<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreMonitor")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn publish_loop<K: BitmapKey, T: Bitmap>(
    store: Arc<BitmapStore<K, T>>,
    sender: SnapshotSender<K>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = StoreSnapshot::new(store.snapshot());
                tracing::trace!(
                    entries = snapshot.items.len(),
                    size = %snapshot.formatted_size(),
                    "Publishing bitmap store snapshot"
                );
                sender.send_replace(Arc::new(snapshot));
            }
        }
    }
}
