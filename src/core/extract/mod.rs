//! # Extract Module
//!
//! Per-file extractors used by the stage handlers.
//!
//! ## Extractors
//! - `exif` - capture time, dimensions, camera and orientation
//! - `thumbnail` - bounded JPEG preview plus an xxh3 content hash
//! - `quality` - sharpness, contrast and brightness with a blur flag
//!
//! All of them report failures as [`ExtractionError`](crate::error::ExtractionError):
//! I/O problems are retryable, undecodable files are not.

pub mod exif;
pub mod quality;
pub mod thumbnail;

pub use self::exif::ExifExtractor;
pub use quality::{QualityAnalyzer, DEFAULT_BLUR_THRESHOLD};
pub use thumbnail::{ThumbnailGenerator, DEFAULT_THUMBNAIL_EDGE};
