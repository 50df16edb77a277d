//! # media-pipeline CLI
//!
//! Command-line interface for the staged media pipeline.
//!
//! ## Usage
//! ```bash
//! media-pipeline scan ~/Photos
//! media-pipeline enqueue exif && media-pipeline work exif --until-idle
//! media-pipeline counts --output json
//! ```

mod cli;

use media_pipeline::Result;

fn main() -> Result<()> {
    cli::run()
}
