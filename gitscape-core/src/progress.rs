//! Progress reporting.
//!
//! Stages call [`ProgressNotifier::emit`]; the notifier stamps a sequence
//! number and timestamp and hands the event to whatever [`ProgressSink`] the
//! caller attached. The pipeline never knows whether the events are being
//! streamed to a client or thrown away.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle stages in the order they may be reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    Queued = 0,
    Cloning = 1,
    Cloned = 2,
    Walking = 3,
    Assembling = 4,
    Done = 5,
    Error = 6,
    Cancelled = 7,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Error | Stage::Cancelled)
    }
}

/// One ordered lifecycle notification.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub sequence: u64,
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Receives progress events. Must be cheap; it is called from stage code.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Drops every event. Backs the blocking interface.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl ProgressSink for DiscardSink {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events into a channel in arrival order. Backs the streaming interface.
///
/// Once the receiver is gone events are silently dropped.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Logs each event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&self, event: ProgressEvent) {
        tracing::info!(
            sequence = event.sequence,
            stage = ?event.stage,
            percentage = ?event.percentage,
            "{}",
            event.message
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events().into_iter().map(|e| e.stage).collect()
    }
}

impl ProgressSink for CollectingSink {
    fn report(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

const NO_STAGE: u8 = u8::MAX;

/// Stamps and orders events for one operation.
///
/// Events whose stage would move backwards, and anything after a terminal
/// stage, are dropped with a warning so consumers only ever observe the
/// documented order.
pub struct ProgressNotifier {
    sink: Arc<dyn ProgressSink>,
    sequence: AtomicU64,
    last_stage: AtomicU8,
}

impl ProgressNotifier {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            sequence: AtomicU64::new(0),
            last_stage: AtomicU8::new(NO_STAGE),
        }
    }

    /// A notifier whose events go nowhere.
    pub fn discard() -> Self {
        Self::new(Arc::new(DiscardSink))
    }

    pub fn emit(&self, stage: Stage, message: impl Into<String>) {
        self.emit_event(stage, message.into(), None);
    }

    pub fn emit_with_percentage(&self, stage: Stage, message: impl Into<String>, percentage: u8) {
        self.emit_event(stage, message.into(), Some(percentage.min(100)));
    }

    /// Stage of the last delivered event, if any.
    pub fn last_stage(&self) -> Option<Stage> {
        stage_from_u8(self.last_stage.load(Ordering::Acquire))
    }

    fn emit_event(&self, stage: Stage, message: String, percentage: Option<u8>) {
        let next = stage as u8;
        let accepted = self
            .last_stage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                match stage_from_u8(prev) {
                    None => Some(next),
                    Some(prev) if prev.is_terminal() => None,
                    Some(prev) if next < prev as u8 => None,
                    Some(_) => Some(next),
                }
            })
            .is_ok();
        if !accepted {
            tracing::warn!(?stage, %message, "Dropping out-of-order progress event");
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.sink.report(ProgressEvent {
            sequence,
            stage,
            message,
            percentage,
            timestamp: Utc::now(),
        });
    }
}

fn stage_from_u8(value: u8) -> Option<Stage> {
    match value {
        0 => Some(Stage::Queued),
        1 => Some(Stage::Cloning),
        2 => Some(Stage::Cloned),
        3 => Some(Stage::Walking),
        4 => Some(Stage::Assembling),
        5 => Some(Stage::Done),
        6 => Some(Stage::Error),
        7 => Some(Stage::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase_and_order_is_enforced() {
        let sink = Arc::new(CollectingSink::new());
        let notifier = ProgressNotifier::new(sink.clone());

        notifier.emit(Stage::Queued, "queued");
        notifier.emit_with_percentage(Stage::Cloning, "10%", 10);
        notifier.emit_with_percentage(Stage::Cloning, "20%", 20);
        notifier.emit(Stage::Queued, "late queued");
        notifier.emit(Stage::Cloned, "cloned");
        notifier.emit(Stage::Done, "done");
        notifier.emit(Stage::Walking, "after done");
        notifier.emit(Stage::Error, "after done");

        let events = sink.events();
        assert_eq!(
            sink.stages(),
            vec![
                Stage::Queued,
                Stage::Cloning,
                Stage::Cloning,
                Stage::Cloned,
                Stage::Done
            ]
        );
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(events[2].percentage, Some(20));
        assert_eq!(notifier.last_stage(), Some(Stage::Done));
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = ProgressNotifier::new(Arc::new(ChannelSink::new(tx)));
        notifier.emit(Stage::Queued, "one");
        drop(rx);
        notifier.emit(Stage::Cloning, "two");
        assert_eq!(notifier.last_stage(), Some(Stage::Cloning));
    }

    #[test]
    fn event_serialises_with_snake_case_stage() {
        let sink = Arc::new(CollectingSink::new());
        let notifier = ProgressNotifier::new(sink.clone());
        notifier.emit(Stage::Assembling, "rendering");
        let json = serde_json::to_value(&sink.events()[0]).unwrap();
        assert_eq!(json["stage"], "assembling");
        assert!(json.get("percentage").is_none());
    }
}
