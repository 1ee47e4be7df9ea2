/// Budget used by [ImageCacheConfig::default]: 64 MiB of decoded pixels.
pub const DEFAULT_BUDGET: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct ImageCacheConfig {
    /// Maximum total estimated cost of the cached images in bytes.
    ///
    /// This is a soft limit: an insertion may go over it, after which least recently used images are evicted until
    /// the total fits again.
    #[builder(default = "DEFAULT_BUDGET")]
    pub budget: u64,
}

impl Default for ImageCacheConfig {
    fn default() -> ImageCacheConfig {
        ImageCacheConfig {
            budget: DEFAULT_BUDGET,
        }
    }
}
