use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::{Bitmap, BitmapEntry, BitmapKey, BitmapLease, EntryState};

/// The outcome of [`BitmapStore::insert`].
#[derive(Debug)]
pub enum Insert<K: BitmapKey, T: Bitmap> {
    /// The entry was inserted, and a lease on it was acquired.
    Inserted(BitmapLease<K, T>),
    /// The key was already present.
    ///
    /// The lease is on the entry that was already stored. The rejected candidate is handed back
    /// to the caller, who is responsible for freeing it.
    Occupied {
        winner: BitmapLease<K, T>,
        candidate: BitmapEntry<K, T>,
    },
}

impl<K: BitmapKey, T: Bitmap> Insert<K, T> {
    /// Whether the candidate entry made it into the store.
    pub fn inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Information about one stored entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo<K> {
    pub key: K,
    pub state: EntryState,
}

struct StoreInner<K, T> {
    entries: HashMap<K, Arc<BitmapEntry<K, T>>>,
    /// Monotonic counter used to order entries by their most recent access.
    tick: u64,
}

impl<K: BitmapKey, T: Bitmap> StoreInner<K, T> {
    fn touch(&mut self, entry: &BitmapEntry<K, T>) {
        self.tick += 1;
        entry.touch(self.tick);
    }

    /// All entries, ordered in the order the eviction scan should visit them.
    fn ordered(&self) -> Vec<(EntryState, Arc<BitmapEntry<K, T>>)> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .map(|entry| (entry.state(), Arc::clone(entry)))
            .collect();

        entries.sort_by(|(a_state, a), (b_state, b)| {
            (a_state.refcount > 0)
                .cmp(&(b_state.refcount > 0))
                .then(a_state.idle_since.cmp(&b_state.idle_since))
                .then(a.last_access().cmp(&b.last_access()))
                .then_with(|| a.key().cmp(b.key()))
        });

        entries
    }
}

/// A concurrent mapping from keys to [`BitmapEntry`]s.
///
/// Holds at most one entry per key. All lookups, mutations and the enumeration of eviction
/// candidates are serialized through one lock. The store never frees bitmaps itself: whoever
/// removes an entry decides when the bitmap goes away by dropping it.
pub struct BitmapStore<K, T> {
    inner: Mutex<StoreInner<K, T>>,
}

impl<K: BitmapKey, T: Bitmap> BitmapStore<K, T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Acquires a lease on the entry for `key`, marking it as most recently used.
    ///
    /// The lease is acquired before the store lock is released, so the entry cannot be evicted
    /// in between.
    pub fn lease(&self, key: &K) -> Option<BitmapLease<K, T>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = Arc::clone(inner.entries.get(key)?);
        inner.touch(&entry);
        Some(BitmapLease::new(entry))
    }

    /// Returns the entry for `key` without acquiring it, marking it as most recently used.
    pub fn get(&self, key: &K) -> Option<Arc<BitmapEntry<K, T>>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = Arc::clone(inner.entries.get(key)?);
        inner.touch(&entry);
        Some(entry)
    }

    /// Returns the state of the entry for `key`, without counting as an access.
    pub fn state(&self, key: &K) -> Option<EntryState> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).map(|entry| entry.state())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().entries.contains_key(key)
    }

    /// Inserts `entry` unless its key is already present.
    ///
    /// The first writer wins: when the key is present, the stored entry is leased and the
    /// candidate is handed back untouched.
    pub fn insert(&self, entry: BitmapEntry<K, T>) -> Insert<K, T> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.entries.get(entry.key()) {
            let existing = Arc::clone(existing);
            inner.touch(&existing);
            return Insert::Occupied {
                winner: BitmapLease::new(existing),
                candidate: entry,
            };
        }

        let entry = Arc::new(entry);
        inner.touch(&entry);
        inner
            .entries
            .insert(entry.key().clone(), Arc::clone(&entry));
        Insert::Inserted(BitmapLease::new(entry))
    }

    /// Unconditionally removes the entry for `key`.
    ///
    /// Callers must make sure nobody references the removed entry before freeing it.
    pub fn remove(&self, key: &K) -> Option<Arc<BitmapEntry<K, T>>> {
        self.inner.lock().unwrap().entries.remove(key)
    }

    /// Removes the entry for `key` if it is unreferenced and `predicate` agrees.
    ///
    /// Both checks happen under the store lock, so no lease can be acquired on the entry between
    /// the check and the removal.
    pub fn remove_if<F>(&self, key: &K, predicate: F) -> Option<Arc<BitmapEntry<K, T>>>
    where
        F: FnOnce(&EntryState) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.entries.get(key)?.state();
        if state.refcount != 0 || !predicate(&state) {
            return None;
        }
        inner.entries.remove(key)
    }

    /// Removes all unreferenced entries.
    pub fn remove_unreferenced(&self) -> Vec<Arc<BitmapEntry<K, T>>> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<_> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.refcount() == 0)
            .map(|(key, _)| key.clone())
            .collect();

        keys.iter()
            .filter_map(|key| inner.entries.remove(key))
            .collect()
    }

    /// Returns all entries in the order the eviction scan should visit them.
    ///
    /// Unreferenced entries come before all referenced ones, so a scan can stop at the first
    /// referenced entry. Among those, entries idle for the longest time come first, followed by
    /// the least recently used ones. Remaining ties are broken by key.
    pub fn eviction_candidates(&self) -> Vec<Arc<BitmapEntry<K, T>>> {
        let inner = self.inner.lock().unwrap();
        inner
            .ordered()
            .into_iter()
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Describes all entries, in eviction order.
    pub fn snapshot(&self) -> Vec<EntryInfo<K>> {
        let inner = self.inner.lock().unwrap();
        inner
            .ordered()
            .into_iter()
            .map(|(state, entry)| EntryInfo {
                key: entry.key().clone(),
                state,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: BitmapKey, T: Bitmap> Default for BitmapStore<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> fmt::Debug for BitmapStore<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .try_lock()
            .map(|inner| inner.entries.len())
            .unwrap_or_default();
        f.debug_struct("BitmapStore")
            .field("entries", &entries)
            .finish()
    }
}
