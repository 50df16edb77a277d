//! Event channel built on crossbeam-channel.
//!
//! Sending is fire-and-forget: once the receiver is dropped, events are
//! discarded and the pipeline carries on.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Event, StageEvent};
use crate::core::media::Stage;
use crate::core::stage::BatchSummary;

/// Cloneable sending half handed to pipeline components
#[derive(Clone, Default)]
pub struct EventSender {
    inner: Option<Sender<Event>>,
}

impl EventSender {
    /// A sender that drops everything
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// Emit any pipeline event; `StageEvent`, `QueueEvent`, `DedupEvent` and
    /// `AuditEvent` convert directly
    pub fn send(&self, event: impl Into<Event>) {
        if let Some(sender) = &self.inner {
            if sender.send(event.into()).is_err() {
                tracing::trace!("Event receiver gone, dropping event");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Receiving half used by the CLI renderer and by tests
pub struct EventReceiver {
    inner: Receiver<Event>,
}

impl EventReceiver {
    /// Blocks between events; ends once every sender is gone
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter()
    }

    /// Everything currently buffered, without blocking
    pub fn drain(&self) -> Vec<Event> {
        self.inner.try_iter().collect()
    }

    /// Drain buffered events, keeping the summaries of completed batches
    pub fn completed_batches(&self) -> Vec<(Stage, BatchSummary)> {
        self.inner
            .try_iter()
            .filter_map(|event| match event {
                Event::Stage(StageEvent::BatchCompleted { stage, summary }) => {
                    Some((stage, summary))
                }
                _ => None,
            })
            .collect()
    }
}

pub struct EventChannel;

impl EventChannel {
    /// Unbounded channel; events are small and the CLI drains continuously
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (EventSender, EventReceiver) {
        let (sender, receiver) = unbounded();
        (
            EventSender {
                inner: Some(sender),
            },
            EventReceiver { inner: receiver },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::QueueEvent;
    use std::thread;

    #[test]
    fn stage_events_cross_threads() {
        let (sender, receiver) = EventChannel::new();

        thread::spawn(move || {
            sender.send(StageEvent::BatchStarted {
                stage: Stage::Hash,
                items: 25,
            });
        })
        .join()
        .unwrap();

        match receiver.iter().next() {
            Some(Event::Stage(StageEvent::BatchStarted { stage, items })) => {
                assert_eq!(stage, Stage::Hash);
                assert_eq!(items, 25);
            }
            other => panic!("unexpected event {:?}", other),
        };
    }

    #[test]
    fn null_sender_swallows_events() {
        let sender = EventSender::null();
        assert!(!sender.is_connected());
        sender.send(QueueEvent::Paused { stage: Stage::Exif });
    }

    #[test]
    fn dropped_receiver_does_not_fail_the_sender() {
        let (sender, receiver) = EventChannel::new();
        drop(receiver);
        sender.send(QueueEvent::Resumed { stage: Stage::Exif });
        assert!(sender.is_connected());
    }

    #[test]
    fn completed_batches_keeps_only_summaries() {
        let (sender, receiver) = EventChannel::new();
        sender.send(StageEvent::BatchStarted {
            stage: Stage::Exif,
            items: 3,
        });
        sender.send(StageEvent::BatchCompleted {
            stage: Stage::Exif,
            summary: BatchSummary {
                processed: 2,
                failed: 1,
                ..BatchSummary::empty(Stage::Exif)
            },
        });
        sender.send(QueueEvent::Paused { stage: Stage::Exif });

        let batches = receiver.completed_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, Stage::Exif);
        assert_eq!(batches[0].1.processed, 2);
        assert!(receiver.drain().is_empty());
    }
}
