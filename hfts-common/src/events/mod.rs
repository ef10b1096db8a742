//! Event types for the pipeline event system
//!
//! Stages publish progress through an [`EventBus`]; monitoring consumers
//! subscribe. Events are informational: stages never depend on another
//! stage receiving them, coordination goes through durable state.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{DominantStation, QualityGrade};

/// Pipeline event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A minute segment was sealed into the raw archive
    MinuteArchived {
        channel: String,
        minute_start: i64,
        archive_id: String,
        sample_count: u64,
        gap_count: usize,
    },

    /// Phase-2 analysis appended a measurement
    MinuteAnalyzed {
        channel: String,
        version: String,
        minute_start: i64,
        quality_grade: QualityGrade,
        dominant_station: DominantStation,
        clock_offset_ms: Option<f64>,
    },

    /// No usable data arrived before the analysis deadline
    MinuteTimedOut {
        channel: String,
        version: String,
        minute_start: i64,
    },

    /// A corrected product was written
    ProductWritten {
        channel: String,
        version: String,
        minute_start: i64,
        output_samples: u64,
    },

    /// Provenance-threatening failure requiring operator attention
    Alert {
        channel: String,
        message: String,
    },
}

impl PipelineEvent {
    pub fn channel(&self) -> &str {
        match self {
            PipelineEvent::MinuteArchived { channel, .. }
            | PipelineEvent::MinuteAnalyzed { channel, .. }
            | PipelineEvent::MinuteTimedOut { channel, .. }
            | PipelineEvent::ProductWritten { channel, .. }
            | PipelineEvent::Alert { channel, .. } => channel,
        }
    }
}

/// Broadcast bus for pipeline events
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit_lossy(PipelineEvent::MinuteTimedOut {
            channel: "WWV_10".into(),
            version: "v1".into(),
            minute_start: 60,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel(), "WWV_10");
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.emit_lossy(PipelineEvent::Alert {
            channel: "x".into(),
            message: "nobody listening".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }

    #[test]
    fn test_event_serialises_with_type_tag() {
        let event = PipelineEvent::ProductWritten {
            channel: "c".into(),
            version: "v2".into(),
            minute_start: 120,
            output_samples: 600,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ProductWritten");
        assert_eq!(json["version"], "v2");
    }
}
