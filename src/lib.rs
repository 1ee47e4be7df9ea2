//! A memory-budgeted LRU cache for decoded images, keyed by path.
//!
//! Decoding an image from disk is expensive, and an application browsing thousands of images can't keep all of them
//! decoded at once.  A plain map from path to image would just grow forever, and a fixed entry count says nothing
//! about memory since one image may be a thumbnail and the next a full-resolution page.  This crate bounds the cache by
//! the estimated decoded size of what it holds instead:
//!
//! [CostBasedLru] does the bookkeeping: every entry carries a cost, and once the summed cost goes over the budget the
//! least recently used entries are dropped until it fits.  It knows nothing about images, so any payload with an
//! [EstimateCost] impl (or an explicit cost per insert) can use it directly.
//!
//! [ImageCache] wraps a [CostBasedLru] of [DecodedImage]s behind a lock, costs each image with [estimate_cost], and is
//! what applications share between their UI and decoding threads.  It never decodes anything: a miss returns `None`,
//! and the caller feeds the decoded result back in with [ImageCache::put].
//!
//! To use this crate, build an [ImageCacheConfig] (the budget is the only option), construct one [ImageCache] at
//! startup, and hand out `Arc`s to it.
mod config;
mod cost_based_lru;
mod estimate_cost;
mod image;
mod image_cache;

pub use config::*;
pub use cost_based_lru::*;
pub use estimate_cost::*;
pub use image::*;
pub use image_cache::*;
