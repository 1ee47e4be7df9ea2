//! The [DecodedImage] value type held by the cache.
//!
//! Decoding happens elsewhere; by the time an image reaches this crate it is a fixed-size pixel buffer with known
//! dimensions and layout, which is all the cost estimate needs.

/// Layout of a single pixel in a [DecodedImage].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PixelFormat {
    Gray8,
    GrayAlpha8,
    Rgb8,
    Rgba8,
    Rgba16,
    RgbaF32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::GrayAlpha8 => 2,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16 => 8,
            PixelFormat::RgbaF32 => 16,
        }
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ImageError {
    #[error("pixel buffer is {actual} bytes but a {width}x{height} {format:?} image needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: u64,
        actual: usize,
    },
    #[error("a {width}x{height} {format:?} image does not fit in memory")]
    TooLarge {
        width: u32,
        height: u32,
        format: PixelFormat,
    },
}

/// A fully decoded, immutable image.
///
/// Once handed to the cache it is only ever shared behind `Arc`, so there is no way to mutate it in place.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl DecodedImage {
    /// Wrap a pixel buffer, checking that its length matches the dimensions.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Result<DecodedImage, ImageError> {
        let expected = (width as u64)
            .checked_mul(height as u64)
            .and_then(|x| x.checked_mul(format.bytes_per_pixel()))
            .ok_or(ImageError::TooLarge {
                width,
                height,
                format,
            })?;

        if expected != pixels.len() as u64 {
            return Err(ImageError::BufferSize {
                width,
                height,
                format,
                expected,
                actual: pixels.len(),
            });
        }

        Ok(DecodedImage {
            width,
            height,
            format,
            pixels,
        })
    }

    /// A zero-sized image, for assets which decoded to nothing.
    pub fn empty(format: PixelFormat) -> DecodedImage {
        DecodedImage {
            width: 0,
            height: 0,
            format,
            pixels: vec![],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels[..]
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}
