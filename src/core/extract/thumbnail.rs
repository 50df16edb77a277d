//! Thumbnail generation.
//!
//! Thumbnails are written to a temporary file in the target directory and
//! renamed into place, so a reader never sees a partial file. Regenerating
//! a thumbnail for the same item overwrites the previous one.

use crate::core::fingerprint::decode_bytes;
use crate::core::media::{MediaId, ThumbnailRecord};
use crate::error::ExtractionError;
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use xxhash_rust::xxh3::xxh3_64;

/// Longest thumbnail edge in pixels
pub const DEFAULT_THUMBNAIL_EDGE: u32 = 256;

/// Writes JPEG thumbnails into one directory
#[derive(Debug, Clone)]
pub struct ThumbnailGenerator {
    dir: PathBuf,
    max_edge: u32,
}

impl ThumbnailGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_edge: DEFAULT_THUMBNAIL_EDGE,
        }
    }

    pub fn with_max_edge(mut self, max_edge: u32) -> Self {
        self.max_edge = max_edge.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final location of the thumbnail for `id`
    pub fn thumbnail_path(&self, id: MediaId) -> PathBuf {
        self.dir.join(format!("{}.jpg", id))
    }

    /// Read `source`, hash its bytes and write a bounded JPEG preview
    pub fn generate(&self, id: MediaId, source: &Path) -> Result<ThumbnailRecord, ExtractionError> {
        let io_error = |source_err: std::io::Error| ExtractionError::Io {
            path: source.to_path_buf(),
            source: source_err,
        };

        let bytes = std::fs::read(source).map_err(io_error)?;
        let file_hash = format!("{:016x}", xxh3_64(&bytes));

        let image = decode_bytes(&bytes).map_err(|_| ExtractionError::Unsupported {
            path: source.to_path_buf(),
        })?;
        let preview = DynamicImage::ImageRgb8(image.thumbnail(self.max_edge, self.max_edge).to_rgb8());

        std::fs::create_dir_all(&self.dir).map_err(io_error)?;
        let mut file = NamedTempFile::new_in(&self.dir).map_err(io_error)?;
        preview
            .write_to(file.as_file_mut(), ImageFormat::Jpeg)
            .map_err(|e| ExtractionError::Failed {
                path: source.to_path_buf(),
                reason: format!("thumbnail encode failed: {}", e),
            })?;

        let target = self.thumbnail_path(id);
        file.persist(&target).map_err(|e| io_error(e.error))?;

        Ok(ThumbnailRecord {
            media_id: id,
            thumbnail_path: target,
            file_hash,
        })
    }
}
