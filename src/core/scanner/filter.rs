//! Decides which directory entries the scanner reports.

use crate::core::media::MediaCategory;
use std::path::Path;

/// Accepts files of a recognised media category
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaFilter {
    include_hidden: bool,
}

impl MediaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include dot-files and dot-directories
    pub fn with_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    pub fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with('.'))
    }

    /// Whether a directory should be descended into
    pub fn should_descend(&self, dir: &Path) -> bool {
        self.include_hidden || !Self::is_hidden(dir)
    }

    /// Category of an accepted file, `None` when the file is skipped
    pub fn accept(&self, path: &Path) -> Option<MediaCategory> {
        if !self.include_hidden && Self::is_hidden(path) {
            return None;
        }
        let category = MediaCategory::from_path(path);
        (!category.is_ignored()).then_some(category)
    }
}
