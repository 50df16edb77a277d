//! Image quality analysis.
//!
//! Sharpness is the variance of the 4-neighbour Laplacian response; blurry
//! images have few strong edges and score low. Contrast is the standard
//! deviation of the luma channel and brightness its mean.

use crate::core::fingerprint::decode_path;
use crate::core::media::AnalysisData;
use crate::error::ExtractionError;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use std::path::Path;

/// Laplacian variance below which an image is flagged as blurry
pub const DEFAULT_BLUR_THRESHOLD: f64 = 100.0;

const DEFAULT_ANALYSIS_EDGE: u32 = 512;

/// Computes [`AnalysisData`] for decoded images
#[derive(Debug, Clone, Copy)]
pub struct QualityAnalyzer {
    /// Longest edge analysed; larger images are downscaled first
    analysis_edge: u32,
    blur_threshold: f64,
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_BLUR_THRESHOLD)
    }
}

impl QualityAnalyzer {
    pub fn new(blur_threshold: f64) -> Self {
        Self {
            analysis_edge: DEFAULT_ANALYSIS_EDGE,
            blur_threshold,
        }
    }

    pub fn with_analysis_edge(mut self, edge: u32) -> Self {
        self.analysis_edge = edge.max(3);
        self
    }

    pub fn analyze_file(&self, path: &Path) -> Result<AnalysisData, ExtractionError> {
        let image = decode_path(path)?;
        Ok(self.analyze_image(&image))
    }

    pub fn analyze_image(&self, image: &DynamicImage) -> AnalysisData {
        let (width, height) = image.dimensions();
        let gray = if width.max(height) > self.analysis_edge {
            image
                .resize(self.analysis_edge, self.analysis_edge, FilterType::Triangle)
                .to_luma8()
        } else {
            image.to_luma8()
        };

        let sharpness = laplacian_variance(&gray);
        let (contrast, brightness) = contrast_and_brightness(&gray);

        AnalysisData {
            sharpness,
            contrast,
            brightness,
            overall: overall_score(sharpness, contrast, brightness),
            is_blurry: sharpness < self.blur_threshold,
        }
    }
}

/// Weighted 0-100 score: sharpness 60%, contrast 30%, mid-range brightness 10%
fn overall_score(sharpness: f64, contrast: f64, brightness: f64) -> f64 {
    let sharpness_norm = (sharpness / 50.0).min(100.0);
    let contrast_norm = (contrast / 0.6).min(100.0);
    let brightness_norm = 100.0 - (brightness - 128.0).abs() / 1.28;
    0.6 * sharpness_norm + 0.3 * contrast_norm + 0.1 * brightness_norm
}

fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let at = |x: u32, y: u32| f64::from(gray.get_pixel(x, y)[0]);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let response =
                at(x, y - 1) + at(x, y + 1) + at(x - 1, y) + at(x + 1, y) - 4.0 * at(x, y);
            sum += response;
            sum_sq += response * response;
            n += 1.0;
        }
    }

    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

fn contrast_and_brightness(gray: &GrayImage) -> (f64, f64) {
    let n = f64::from(gray.width()) * f64::from(gray.height());
    if n == 0.0 {
        return (0.0, 128.0);
    }

    let (sum, sum_sq) = gray.pixels().fold((0.0, 0.0), |(s, sq), p| {
        let v = f64::from(p[0]);
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (variance.sqrt(), mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn uniform(value: u8, size: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_pixel(size, size, Luma([value])))
    }

    fn checkerboard(size: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(size, size, |x, y| {
            Luma([if (x + y) % 2 == 0 { 0 } else { 255 }])
        }))
    }

    #[test]
    fn uniform_image_is_blurry_and_flat() {
        let data = QualityAnalyzer::default().analyze_image(&uniform(128, 64));
        assert!(data.sharpness < 1.0);
        assert!(data.contrast < 1.0);
        assert!(data.is_blurry);
    }

    #[test]
    fn checkerboard_is_sharp() {
        let data = QualityAnalyzer::default().analyze_image(&checkerboard(64));
        assert!(data.sharpness > 1000.0, "got {}", data.sharpness);
        assert!(!data.is_blurry);
        assert!(data.overall > QualityAnalyzer::default().analyze_image(&uniform(128, 64)).overall);
    }

    #[test]
    fn brightness_is_the_mean_luma() {
        let dark = QualityAnalyzer::default().analyze_image(&uniform(50, 32));
        let bright = QualityAnalyzer::default().analyze_image(&uniform(200, 32));
        assert!((dark.brightness - 50.0).abs() < 0.5);
        assert!((bright.brightness - 200.0).abs() < 0.5);
    }

    #[test]
    fn threshold_decides_the_blur_flag() {
        let image = checkerboard(32);
        assert!(QualityAnalyzer::new(f64::MAX).analyze_image(&image).is_blurry);
        assert!(!QualityAnalyzer::new(0.0).analyze_image(&image).is_blurry);
    }

    #[test]
    fn large_images_are_downscaled() {
        let analyzer = QualityAnalyzer::default().with_analysis_edge(16);
        let data = analyzer.analyze_image(&uniform(90, 200));
        assert!((data.brightness - 90.0).abs() < 0.5);
    }
}
