//! Directory walking using walkdir.

use super::filter::MediaFilter;
use super::ScanResult;
use crate::core::media::{MediaId, NewMedia};
use crate::error::ScanError;
use crate::events::{EventSender, ScanProgress, StageEvent};
use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

/// Emit a progress event every this many directories
const PROGRESS_EVERY: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub follow_symlinks: bool,
    pub include_hidden: bool,
    /// Maximum directory depth (None = unlimited)
    pub max_depth: Option<usize>,
}

/// Scanner implementation using the walkdir crate
#[derive(Debug, Clone)]
pub struct WalkDirScanner {
    config: ScanConfig,
    filter: MediaFilter,
}

impl WalkDirScanner {
    pub fn new(config: ScanConfig) -> Self {
        let filter = MediaFilter::new().with_hidden(config.include_hidden);
        Self { config, filter }
    }

    /// Walk one root in file-name order.
    ///
    /// Unreadable entries are collected in the result; only a missing root
    /// fails the whole scan.
    pub fn scan(&self, root: &Path, events: &EventSender) -> Result<ScanResult, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::DirectoryNotFound {
                path: root.to_path_buf(),
            });
        }

        let mut walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        if let Some(depth) = self.config.max_depth {
            walker = walker.max_depth(depth);
        }

        let filter = self.filter;
        let entries = walker
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_type().is_dir() || filter.should_descend(e.path()));

        let mut result = ScanResult::default();
        let mut directories = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(root).to_path_buf();
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    tracing::warn!("Skipping {}: {}", path.display(), source);
                    result.errors.push(ScanError::ReadDirectory { path, source });
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                directories += 1;
                if directories % PROGRESS_EVERY == 0 {
                    events.send(StageEvent::ScanProgress(ScanProgress {
                        root: root.to_path_buf(),
                        directories_scanned: directories,
                        files_found: result.media.len(),
                        current_path: entry.path().to_path_buf(),
                    }));
                }
                continue;
            }

            let Some(category) = self.filter.accept(entry.path()) else {
                continue;
            };
            match entry.metadata() {
                Ok(metadata) => result.media.push(NewMedia {
                    id: MediaId::new(),
                    path: entry.path().to_path_buf(),
                    size_bytes: metadata.len(),
                    category,
                }),
                Err(e) => {
                    let path = entry.path().to_path_buf();
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                    result.errors.push(ScanError::ReadDirectory { path, source });
                }
            }
        }

        tracing::info!(
            "Scanned {}: {} media files in {} directories, {} errors",
            root.display(),
            result.media.len(),
            directories,
            result.errors.len()
        );
        Ok(result)
    }
}

impl Default for WalkDirScanner {
    fn default() -> Self {
        Self::new(ScanConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::MediaCategory;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
    }

    fn names(result: &ScanResult) -> Vec<String> {
        result
            .media
            .iter()
            .map(|m| m.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn empty_directory_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let result = WalkDirScanner::default()
            .scan(dir.path(), &EventSender::null())
            .unwrap();
        assert!(result.media.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn finds_media_in_nested_directories_in_name_order() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("2021");
        fs::create_dir(&nested).unwrap();
        touch(dir.path(), "b.jpg");
        touch(dir.path(), "a.nef");
        touch(&nested, "c.mov");
        touch(dir.path(), "readme.txt");

        let result = WalkDirScanner::default()
            .scan(dir.path(), &EventSender::null())
            .unwrap();

        assert_eq!(names(&result), vec!["c.mov", "a.nef", "b.jpg"]);
        assert_eq!(result.media[1].category, MediaCategory::Raw);
        assert_eq!(result.media[2].size_bytes, 4);
    }

    #[test]
    fn hidden_directories_are_pruned_by_default() {
        let dir = TempDir::new().unwrap();
        let hidden = dir.path().join(".cache");
        fs::create_dir(&hidden).unwrap();
        touch(&hidden, "inside.jpg");
        touch(dir.path(), "visible.jpg");

        let default = WalkDirScanner::default()
            .scan(dir.path(), &EventSender::null())
            .unwrap();
        assert_eq!(names(&default), vec!["visible.jpg"]);

        let all = WalkDirScanner::new(ScanConfig {
            include_hidden: true,
            ..ScanConfig::default()
        })
        .scan(dir.path(), &EventSender::null())
        .unwrap();
        assert_eq!(all.media.len(), 2);
    }

    #[test]
    fn missing_root_is_an_error() {
        let result = WalkDirScanner::default()
            .scan(Path::new("/nonexistent/path/12345"), &EventSender::null());
        assert!(matches!(result, Err(ScanError::DirectoryNotFound { .. })));
    }
}
