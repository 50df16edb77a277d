//! # Scanner Module
//!
//! Discovers media files under a folder for the scan stage.
//!
//! ## Categories
//! Files are classified by extension (see
//! [`MediaCategory::from_extension`](crate::core::media::MediaCategory::from_extension)).
//! Anything outside the image, RAW and video categories is skipped, as are
//! hidden files and directories unless configured otherwise.

mod filter;
mod walker;

pub use filter::MediaFilter;
pub use walker::{ScanConfig, WalkDirScanner};

use crate::core::media::NewMedia;
use crate::error::ScanError;

/// Files found under one root
#[derive(Debug, Default)]
pub struct ScanResult {
    pub media: Vec<NewMedia>,
    /// Entries that could not be read; the rest of the walk continued
    pub errors: Vec<ScanError>,
}
