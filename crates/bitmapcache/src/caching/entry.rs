use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use super::{Bitmap, BitmapKey, Clock};

/// The state of a [`BitmapEntry`] at one point in time.
///
/// This is what an [`EvictionPolicy`](super::EvictionPolicy) bases its decision on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    /// The number of live leases on the entry.
    pub refcount: usize,
    /// When the reference count last dropped to zero, or when the entry was created if it was
    /// never released.
    pub idle_since: Instant,
    /// The estimated memory held by the bitmap.
    pub estimated_bytes: u64,
}

/// A decoded bitmap owned by the cache, together with its reference count.
///
/// Entries are created by the [`BitmapCache`](super::BitmapCache) when a load finishes and are
/// only ever freed after they have been removed from the [`BitmapStore`](super::BitmapStore) with
/// a reference count of zero. Leases keep the entry alive, but never free it.
pub struct BitmapEntry<K, T> {
    key: K,
    bitmap: T,
    refcount: AtomicUsize,
    /// Written while holding the lock across the final decrement, so that readers of
    /// [`state`](Self::state) never see a zero count paired with an outdated timestamp.
    idle_since: Mutex<Instant>,
    /// Store tick of the most recent lookup.
    last_access: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<K: BitmapKey, T: Bitmap> BitmapEntry<K, T> {
    /// Creates an unreferenced entry that counts as idle from now on.
    pub fn new(key: K, bitmap: T, clock: Arc<dyn Clock>) -> Self {
        Self {
            key,
            bitmap,
            refcount: AtomicUsize::new(0),
            idle_since: Mutex::new(clock.now()),
            last_access: AtomicU64::new(0),
            clock,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn bitmap(&self) -> &T {
        &self.bitmap
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn idle_since(&self) -> Instant {
        *self.idle_since.lock().unwrap()
    }

    /// Returns a consistent view of the reference count and idle timestamp.
    pub fn state(&self) -> EntryState {
        let idle_since = self.idle_since.lock().unwrap();
        EntryState {
            refcount: self.refcount.load(Ordering::Acquire),
            idle_since: *idle_since,
            estimated_bytes: self.bitmap.estimated_bytes(),
        }
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }

    pub(crate) fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference, and marks the entry as idle when it was the last one.
    pub(crate) fn release(&self) {
        let mut idle_since = self.idle_since.lock().unwrap();
        let previous = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });

        match previous {
            Ok(1) => *idle_since = self.clock.now(),
            Ok(_) => {}
            Err(_) => {
                debug_assert!(false, "bitmap entry released more often than acquired");
                tracing::error!(
                    key = ?self.key,
                    "Bitmap entry released more often than acquired"
                );
            }
        }
    }
}

impl<K: fmt::Debug, T> fmt::Debug for BitmapEntry<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapEntry")
            .field("key", &self.key)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A handle granting access to a cached bitmap.
///
/// A lease holds one reference on its entry from creation until it is released, either
/// explicitly through [`release`](Self::release) or by dropping it. As long as any lease on an
/// entry is live, the entry will not be evicted.
///
/// Once released, [`bitmap`](Self::bitmap) returns `None`, so a control holding on to a released
/// lease renders as "not loaded" rather than touching a bitmap that might be freed.
pub struct BitmapLease<K: BitmapKey, T: Bitmap> {
    entry: Option<Arc<BitmapEntry<K, T>>>,
}

impl<K: BitmapKey, T: Bitmap> BitmapLease<K, T> {
    /// Acquires a new lease on `entry`.
    pub(crate) fn new(entry: Arc<BitmapEntry<K, T>>) -> Self {
        entry.acquire();
        Self { entry: Some(entry) }
    }

    /// The leased bitmap, or `None` once the lease was released.
    pub fn bitmap(&self) -> Option<&T> {
        self.entry.as_deref().map(BitmapEntry::bitmap)
    }

    /// The key of the leased bitmap, or `None` once the lease was released.
    pub fn key(&self) -> Option<&K> {
        self.entry.as_deref().map(BitmapEntry::key)
    }

    pub fn is_released(&self) -> bool {
        self.entry.is_none()
    }

    /// Gives up this lease.
    ///
    /// Only the first call has an effect; later calls do nothing.
    pub fn release(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.release();
        }
    }
}

impl<K: BitmapKey, T: Bitmap> Clone for BitmapLease<K, T> {
    /// Creates another lease on the same entry, or another released lease.
    fn clone(&self) -> Self {
        match &self.entry {
            Some(entry) => Self::new(Arc::clone(entry)),
            None => Self { entry: None },
        }
    }
}

impl<K: BitmapKey, T: Bitmap> Drop for BitmapLease<K, T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<K: BitmapKey, T: Bitmap> fmt::Debug for BitmapLease<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapLease")
            .field("entry", &self.entry)
            .finish()
    }
}
