//! Ordered, timestamped record of what a session processed.
//!
//! One entry per event handed to the state machine. Requests emitted while
//! handling an event are attached to that event's entry.

use chrono::{DateTime, Utc};
use lqbench_core::RpcRequest;
use serde::Serialize;
use serde_json::Value;

use crate::state::Stage;
use crate::timers::TimerPurpose;

/// The event an entry records.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedEvent {
    /// A real inbound frame.
    Inbound {
        /// The frame as received.
        message: Value,
    },
    /// A synthetic continue marker.
    Continue,
    /// A timer expiry forwarded to the machine.
    Timer {
        /// Which timer fired.
        purpose: TimerPurpose,
    },
}

/// A single transcript record.
#[derive(Clone, Debug, Serialize)]
pub struct TranscriptEntry {
    /// When the event was processed.
    pub at: DateTime<Utc>,
    /// Stage the machine was in when it processed the event.
    pub stage: Stage,
    /// The event.
    pub event: RecordedEvent,
    /// Requests sent in reaction.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sent: Vec<RpcRequest>,
}

/// Ordered transcript of a session.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    /// Append an entry for a newly processed event.
    pub fn record(&mut self, stage: Stage, event: RecordedEvent) {
        self.entries.push(TranscriptEntry {
            at: Utc::now(),
            stage,
            event,
            sent: Vec::new(),
        });
    }

    /// Attach an outbound request to the latest entry.
    pub fn attach_sent(&mut self, request: RpcRequest) {
        if let Some(last) = self.entries.last_mut() {
            last.sent.push(request);
        }
    }

    /// Entries in processing order.
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Number of processed events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been processed yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total requests recorded across all entries.
    pub fn sent_count(&self) -> usize {
        self.entries.iter().map(|e| e.sent.len()).sum()
    }

    /// Render as JSON for diagnostics.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("\"<unserializable: {e}>\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lqbench_core::CorrelationId;
    use serde_json::json;

    #[test]
    fn sent_requests_attach_to_latest_entry() {
        let mut t = Transcript::default();
        t.record(Stage::SigningIn, RecordedEvent::Continue);
        t.attach_sent(RpcRequest::signin(CorrelationId::from("s"), "u", "p"));
        t.record(
            Stage::SigningIn,
            RecordedEvent::Inbound { message: json!({"id": "s", "result": "tok"}) },
        );

        assert_eq!(t.len(), 2);
        assert_eq!(t.entries()[0].sent.len(), 1);
        assert!(t.entries()[1].sent.is_empty());
        assert_eq!(t.sent_count(), 1);
    }

    #[test]
    fn attach_without_entry_is_dropped() {
        let mut t = Transcript::default();
        t.attach_sent(RpcRequest::query(CorrelationId::from("q"), "x"));
        assert!(t.is_empty());
        assert_eq!(t.sent_count(), 0);
    }

    #[test]
    fn serializes_as_tagged_list() {
        let mut t = Transcript::default();
        t.record(Stage::GeneratingLoad, RecordedEvent::Timer { purpose: TimerPurpose::LoadWait });
        let v: Value = serde_json::from_str(&t.to_json()).unwrap();
        assert_eq!(v[0]["event"]["type"], "timer");
        assert_eq!(v[0]["event"]["purpose"], "load_wait");
        assert_eq!(v[0]["stage"], "generating_load");
        assert!(v[0].get("sent").is_none());
    }
}
