//! # Media Pipeline
//!
//! Staged ingest of a media library with perceptual-hash duplicate detection.
//!
//! ## Core Philosophy
//! - **Never lose work** - every stage runs on leased, retrying jobs and
//!   redelivered work overwrites instead of duplicating
//! - **Batch the writes** - a batch costs one store transaction
//! - **Never auto-delete** - resolved duplicates are only soft-deleted
//!
//! ## Architecture
//! - `core` - Fingerprinting, clustering, queues, stages and storage
//! - `config` - TOML and environment configuration
//! - `events` - Event-driven progress reporting
//! - `error` - Error types

pub mod config;
pub mod core;
pub mod error;
pub mod events;

// Re-export commonly used types at the crate root
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};

/// Initialize tracing for the library
///
/// This should be called by the application entry point. `RUST_LOG` wins
/// when set; otherwise `verbose` selects `debug` over `info`. Calling it a
/// second time is a no-op.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
