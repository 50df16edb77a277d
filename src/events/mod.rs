//! # Events Module
//!
//! Progress reporting for any UI layer.
//!
//! ## Design
//! Pipeline components hold an [`EventSender`] and emit [`Event`]s at batch
//! and administrative boundaries. The CLI renders them; tests drain them.
//! Sending never fails or blocks the pipeline.
//!
//! ## Example
//! ```rust,ignore
//! let (sender, receiver) = EventChannel::new();
//! std::thread::spawn(move || {
//!     for event in receiver.iter() {
//!         if let Event::Stage(StageEvent::BatchCompleted { stage, summary }) = event {
//!             println!("{}: {} processed", stage, summary.processed);
//!         }
//!     }
//! });
//! ```

mod channel;
mod types;

pub use channel::{EventChannel, EventReceiver, EventSender};
pub use types::*;
