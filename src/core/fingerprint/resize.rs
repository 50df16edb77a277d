//! SIMD-accelerated greyscale resizing for fingerprint grids.
//!
//! Uses fast_image_resize, which picks AVX2/NEON kernels when available.

use crate::error::FingerprintError;
use fast_image_resize::{images::Image, FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};

/// Greyscale resizer that can be reused across images
pub struct GridResizer {
    resizer: Resizer,
}

impl GridResizer {
    pub fn new() -> Self {
        Self {
            resizer: Resizer::new(),
        }
    }

    /// Convert to single-channel greyscale, then force-fill to `width` x `height`.
    ///
    /// Aspect ratio is not preserved.
    pub fn resize_to_grayscale(
        &mut self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<GrayImage, FingerprintError> {
        let gray = image.to_luma8();
        let (src_width, src_height) = gray.dimensions();

        if src_width == 0 || src_height == 0 || width == 0 || height == 0 {
            return Err(FingerprintError::InvalidImage {
                reason: format!(
                    "cannot resize {}x{} to {}x{}",
                    src_width, src_height, width, height
                ),
            });
        }

        let src_image = Image::from_vec_u8(src_width, src_height, gray.into_raw(), PixelType::U8)
            .map_err(|e| FingerprintError::InvalidImage {
                reason: format!("bad source buffer: {}", e),
            })?;

        let mut dst_image = Image::new(width, height, PixelType::U8);
        let options =
            ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));

        self.resizer
            .resize(&src_image, &mut dst_image, &options)
            .map_err(|e| FingerprintError::InvalidImage {
                reason: format!("resize failed: {}", e),
            })?;

        let buffer: ImageBuffer<Luma<u8>, Vec<u8>> =
            ImageBuffer::from_raw(width, height, dst_image.into_vec()).ok_or_else(|| {
                FingerprintError::InvalidImage {
                    reason: "resized buffer has the wrong length".to_string(),
                }
            })?;

        Ok(buffer)
    }
}

impl Default for GridResizer {
    fn default() -> Self {
        Self::new()
    }
}

/// One-off resize helper
pub fn resize_to_grayscale(
    image: &DynamicImage,
    width: u32,
    height: u32,
) -> Result<GrayImage, FingerprintError> {
    GridResizer::new().resize_to_grayscale(image, width, height)
}
