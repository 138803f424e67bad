//! # Bitmap caching
//!
//! Image controls ask for bitmaps by key (typically the source URL or path). Fetching and
//! decoding is slow and decoded bitmaps are big, so this module makes sure that:
//!
//! - every key is loaded and decoded at most once at a time, no matter how many controls ask for
//!   it concurrently,
//! - all controls displaying the same image share one decoded bitmap,
//! - a bitmap is freed once it has not been displayed for a while, and never while a control
//!   still displays it.
//!
//! ## Ownership
//!
//! A decoded bitmap is owned by a [`BitmapEntry`], which lives in the [`BitmapStore`] of a
//! [`BitmapCache`]. Controls never own the bitmap; they hold a [`BitmapLease`] instead. Creating
//! a lease increments the reference count of the entry, and releasing (or dropping) it decrements
//! the count again. When the count reaches zero, the entry remembers the point in time it became
//! idle.
//!
//! A background task of the [`BitmapCache`] periodically scans the store, unreferenced entries
//! first and longest-idle entries before others, and asks the [`EvictionPolicy`] whether an entry
//! may be freed. Entries are removed from the store only while holding the store lock and after
//! re-checking that nobody acquired them in the meantime. Handing out a lease for a stored entry
//! happens under the same lock, so an entry is never freed between being looked up and being
//! leased.
//!
//! ## Request coalescing
//!
//! On a store miss, [`BitmapCache::get_or_add`] spawns the load onto the runtime and registers it
//! as a pending load for the key. Concurrent requests for the same key await the pending load
//! instead of starting another one. Failures are shared with all of them and are never cached,
//! so the next request starts over.
//!
//! ### Metrics
//!
//! - `bitmaps.access`: All accesses.
//! - `bitmaps.memory.hit`: Accesses served from the store.
//! - `bitmaps.load.coalesced`: Accesses that joined a pending load.
//! - `bitmaps.load.started`: Loads actually being run.
//! - `bitmaps.load.failed`: Loads that failed or panicked, tagged with `reason` (`error` or
//!   `panic`).
//! - `bitmaps.load.duration`: Time spent in loads.
//! - `bitmaps.insert.lost_race`: Freshly loaded bitmaps that were discarded because the key was
//!   already cached.
//! - `bitmaps.evicted`: Bitmaps freed by the eviction scan or an explicit clear.
//! - `bitmaps.entries`: Number of entries in the store, as a gauge.

use std::fmt;
use std::hash::Hash;

mod clock;
mod coordinator;
mod entry;
mod error;
mod monitor;
mod policy;
mod store;

pub use clock::*;
pub use coordinator::*;
pub use entry::*;
pub use error::*;
pub use monitor::*;
pub use policy::*;
pub use store::*;

/// Keys identify cached bitmaps.
///
/// This is implemented for everything that can be used as a key, most commonly `String`s
/// holding the image source.
pub trait BitmapKey: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static {}

impl<K> BitmapKey for K where K: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static {}

/// A decoded image held in memory.
pub trait Bitmap: Send + Sync + 'static {
    /// The dimensions of the bitmap in pixels, as `(width, height)`.
    fn pixel_size(&self) -> (u32, u32);

    /// An estimate of the memory held by this bitmap, in bytes.
    ///
    /// Defaults to four bytes per pixel.
    fn estimated_bytes(&self) -> u64 {
        let (width, height) = self.pixel_size();
        u64::from(width) * u64::from(height) * 4
    }
}
