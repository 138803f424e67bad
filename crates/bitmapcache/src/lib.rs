//! In-memory bitmap caching for image controls.
//!
//! Decoded images are expensive: fetching and decoding them should happen once per source, and
//! the decoded pixels should be freed once no control displays them anymore. This crate provides
//! the reference-counted cache that sits between the image controls and whatever fetches and
//! decodes the images.
//!
//! See the [`caching`] module for how the cache works.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod provider;
pub mod utils;

pub use caching::{
    Bitmap, BitmapCache, BitmapCacheBuilder, BitmapKey, BitmapLease, EntryState, EvictionPolicy,
    IdleTimeoutPolicy, LoadError,
};
pub use provider::{ImageProvider, LoadBitmap, ProvidedBitmap};
