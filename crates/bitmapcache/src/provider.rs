//! Connecting image controls to bitmap sources.
//!
//! A control asks an [`ImageProvider`] for a bitmap. Depending on how the provider was set up,
//! the bitmap is either loaded for that control alone, or shared with all other controls through
//! a [`BitmapCache`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::caching::{Bitmap, BitmapCache, BitmapKey, BitmapLease, LoadError};

/// Fetches and decodes the bitmap for a key.
///
/// Implementations return `Ok(None)` when the key does not resolve to an image. They never
/// retry; retrying is up to whoever requests the bitmap again.
pub trait LoadBitmap<K, T>: Send + Sync + 'static {
    fn load(&self, key: K) -> BoxFuture<'static, anyhow::Result<Option<T>>>;
}

impl<K, T, F, Fut> LoadBitmap<K, T> for F
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
{
    fn load(&self, key: K) -> BoxFuture<'static, anyhow::Result<Option<T>>> {
        self(key).boxed()
    }
}

/// A bitmap handed out by an [`ImageProvider`].
#[derive(Debug)]
pub enum ProvidedBitmap<K: BitmapKey, T: Bitmap> {
    /// A bitmap owned by the requester alone.
    Owned(T),
    /// A bitmap shared through a [`BitmapCache`].
    Leased(BitmapLease<K, T>),
}

impl<K: BitmapKey, T: Bitmap> ProvidedBitmap<K, T> {
    /// The bitmap, or `None` if it was leased and the lease has been released.
    pub fn bitmap(&self) -> Option<&T> {
        match self {
            Self::Owned(bitmap) => Some(bitmap),
            Self::Leased(lease) => lease.bitmap(),
        }
    }

    pub fn is_leased(&self) -> bool {
        matches!(self, Self::Leased(_))
    }
}

/// Where image controls get their bitmaps from.
///
/// The variant is picked once when the provider is created.
pub enum ImageProvider<K: BitmapKey, T: Bitmap> {
    /// Every request loads its own bitmap.
    Direct(Arc<dyn LoadBitmap<K, T>>),
    /// Requests share bitmaps through `cache`, which calls `loader` on a miss.
    Coordinated {
        cache: Arc<BitmapCache<K, T>>,
        loader: Arc<dyn LoadBitmap<K, T>>,
    },
}

impl<K: BitmapKey, T: Bitmap> ImageProvider<K, T> {
    pub fn direct(loader: impl LoadBitmap<K, T>) -> Self {
        Self::Direct(Arc::new(loader))
    }

    pub fn coordinated(cache: Arc<BitmapCache<K, T>>, loader: impl LoadBitmap<K, T>) -> Self {
        Self::Coordinated {
            cache,
            loader: Arc::new(loader),
        }
    }

    pub fn is_coordinated(&self) -> bool {
        matches!(self, Self::Coordinated { .. })
    }

    /// Provides the bitmap for `key`.
    ///
    /// Returns `Ok(None)` if the loader did not produce a bitmap.
    pub async fn provide(&self, key: K) -> Result<Option<ProvidedBitmap<K, T>>, LoadError> {
        match self {
            Self::Direct(loader) => {
                let bitmap = loader.load(key).await.map_err(LoadError::failed)?;
                Ok(bitmap.map(ProvidedBitmap::Owned))
            }
            Self::Coordinated { cache, loader } => {
                let loader = Arc::clone(loader);
                let lease = cache
                    .get_or_add(key, move |key| loader.load(key))
                    .await?;
                Ok(lease.map(ProvidedBitmap::Leased))
            }
        }
    }
}

impl<K: BitmapKey, T: Bitmap> fmt::Debug for ImageProvider<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.debug_tuple("Direct").finish_non_exhaustive(),
            Self::Coordinated { cache, .. } => f
                .debug_struct("Coordinated")
                .field("cache", cache)
                .finish_non_exhaustive(),
        }
    }
}
