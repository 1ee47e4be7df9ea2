//! Estimate how much memory a decoded item keeps resident.
use crate::DecodedImage;

///Estimate the cost of an item.  This is usually in bytes.
///
/// [crate::CostBasedLru::insert_estimated] charges values whatever this returns.  Estimates must never fail; something
/// which can't be measured should cost 0.
pub trait EstimateCost {
    fn estimate_cost(&self) -> u64;
}

/// Decoded size of an image: `width * height * bytes_per_pixel`.
///
/// This deliberately ignores the size of the buffer actually attached to the image and whatever the asset took on
/// disk.  An image with a zero dimension costs nothing.
pub fn estimate_cost(image: &DecodedImage) -> u64 {
    (image.width() as u64)
        .saturating_mul(image.height() as u64)
        .saturating_mul(image.format().bytes_per_pixel())
}

impl EstimateCost for DecodedImage {
    fn estimate_cost(&self) -> u64 {
        estimate_cost(self)
    }
}
