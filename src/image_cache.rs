//! The [ImageCache] is the thread-safe front end over a [CostBasedLru] of [DecodedImage]s keyed by path.
//!
//! The cache never decodes anything itself.  A miss is just `None`; whoever wanted the image is expected to decode it
//! however they like (usually on a background thread) and then hand the result back with [ImageCache::put].  Two
//! threads which miss on the same path at the same time will both decode it, and the second `put` simply replaces the
//! first.  Callers that care about the duplicated work need to coordinate outside the cache.
//!
//! Every operation takes the same lock for its whole duration, so the entries, their costs, and the recency order are
//! never seen half updated.  Nothing slow happens under the lock: estimating a cost is a multiplication of the
//! dimensions, and eviction only drops the cache's reference to each evicted image.  Anyone still holding an `Arc` from
//! [ImageCache::get] keeps a perfectly valid image.
//!
//! There is no global instance.  Construct one at startup and share it as an `Arc<ImageCache>`.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};

use crate::*;

/// A point-in-time view of the cache's counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Number of images currently held.
    pub entries: usize,
    /// Total estimated cost of the held images in bytes.
    pub total_cost: u64,
    pub budget: u64,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    insertions: u64,
    evictions: u64,
}

struct Inner {
    lru: CostBasedLru<str, DecodedImage>,
    counters: Counters,
}

pub struct ImageCache {
    config: ImageCacheConfig,
    inner: Mutex<Inner>,
}

impl ImageCache {
    pub fn new(config: ImageCacheConfig) -> ImageCache {
        ImageCache {
            inner: Mutex::new(Inner {
                lru: CostBasedLru::new(config.budget),
                counters: Default::default(),
            }),
            config,
        }
    }

    pub fn with_budget(budget: u64) -> ImageCache {
        ImageCache::new(ImageCacheConfig { budget })
    }

    /// Lock the state.
    ///
    /// Every operation leaves the bookkeeping consistent before it can call into anything that could panic, so a
    /// poisoned lock still guards usable state.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the image for `path`, marking it as the most recently used.
    ///
    /// Returns `None` on a miss, which is not an error and does not start any decoding.
    pub fn get(&self, path: &str) -> Option<Arc<DecodedImage>> {
        self.get_with_cost(path).map(|x| x.0)
    }

    /// Like [ImageCache::get], but also return the cost the image is accounted at.
    ///
    /// Both values are read under the same lock, so they always belong to the same insertion.
    pub fn get_with_cost(&self, path: &str) -> Option<(Arc<DecodedImage>, u64)> {
        let found = {
            let mut guard = self.lock();
            let found = guard.lru.get_with_cost(path);
            if found.is_some() {
                guard.counters.hits += 1;
            } else {
                guard.counters.misses += 1;
            }
            found
        };

        match found {
            Some(_) => trace!("Image cache hit: {}", path),
            None => trace!("Image cache miss: {}", path),
        }
        found
    }

    /// Look up an image without changing when it will be evicted, or counting a hit or miss.
    pub fn peek(&self, path: &str) -> Option<Arc<DecodedImage>> {
        self.lock().lru.peek(path)
    }

    /// Insert or replace the image for `path`, returning the image it replaced.
    ///
    /// The new image becomes the most recently used, and then least recently used images are evicted until the total
    /// cost is back under budget.  An image which is on its own bigger than the budget is still cached; it just pushes
    /// everything else out.  An empty path is ignored.
    pub fn put(&self, path: &str, image: impl Into<Arc<DecodedImage>>) -> Option<Arc<DecodedImage>> {
        if path.is_empty() {
            debug!("Ignoring image cache insert with an empty path");
            return None;
        }

        let (res, total) = {
            let mut guard = self.lock();
            let res = guard.lru.insert_estimated(path.into(), image.into());
            guard.counters.insertions += 1;
            guard.counters.evictions += res.evicted.len() as u64;
            (res, guard.lru.current_cost())
        };

        debug!(
            "Image cache {} {} at cost {}, total {} of {}",
            if res.replaced.is_some() {
                "replaced"
            } else {
                "inserted"
            },
            path,
            res.cost,
            total,
            self.config.budget
        );
        for e in res.evicted.iter() {
            debug!("Image cache evicted {} (cost {})", e.key, e.cost);
        }
        if total > self.config.budget {
            warn!(
                "Image {} costs {} which is over the whole cache budget of {}",
                path, res.cost, self.config.budget
            );
        }

        res.replaced
    }

    /// Remove the image for `path`, if any.  Removing something which isn't cached does nothing.
    pub fn remove(&self, path: &str) -> Option<Arc<DecodedImage>> {
        let removed = self.lock().lru.remove(path);
        if removed.is_some() {
            debug!("Image cache removed {}", path);
        }
        removed
    }

    /// Either [ImageCache::put] or [ImageCache::remove], depending on whether there is an image.
    ///
    /// Prefer calling those directly; this exists for callers that forward an optional decode result.
    pub fn update(&self, path: &str, image: Option<Arc<DecodedImage>>) {
        match image {
            Some(i) => {
                self.put(path, i);
            }
            None => {
                self.remove(path);
            }
        }
    }

    /// Is `path` cached?  Unlike [ImageCache::get], this doesn't count as a use.
    pub fn contains(&self, path: &str) -> bool {
        self.lock().lru.contains_key(path)
    }

    /// Number of images currently held.
    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lru.is_empty()
    }

    /// Total estimated cost of the held images in bytes.
    pub fn memory_of_loaded_images(&self) -> u64 {
        self.lock().lru.current_cost()
    }

    pub fn budget(&self) -> u64 {
        self.config.budget
    }

    /// Drop every image, for example in response to a memory warning.  Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let count = self.lock().lru.clear();
        debug!("Image cache cleared {} images", count);
        count
    }

    /// Evict least recently used images until at most `target` bytes are held.  Returns how many were evicted.
    ///
    /// The budget is unchanged, so the cache is free to grow back afterwards.
    pub fn trim_to(&self, target: u64) -> usize {
        let count = {
            let mut guard = self.lock();
            let evicted = guard.lru.trim_to(target);
            guard.counters.evictions += evicted.len() as u64;
            evicted.len()
        };
        debug!("Image cache trimmed {} images to fit {}", count, target);
        count
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.lock();
        CacheStats {
            entries: guard.lru.len(),
            total_cost: guard.lru.current_cost(),
            budget: self.config.budget,
            hits: guard.counters.hits,
            misses: guard.counters.misses,
            insertions: guard.counters.insertions,
            evictions: guard.counters.evictions,
        }
    }

    /// The cached paths, from most to least recently used.
    pub fn paths(&self) -> Vec<String> {
        self.lock().lru.iter().map(|x| x.0.to_string()).collect()
    }

    /// Verify the internal bookkeeping; see [CostBasedLru::check_invariants].
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.lock().lru.check_invariants()
    }
}

impl Default for ImageCache {
    fn default() -> ImageCache {
        ImageCache::new(Default::default())
    }
}
