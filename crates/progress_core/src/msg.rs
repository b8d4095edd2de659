use chrono::{DateTime, Utc};

use crate::ProgressState;

/// Name of the push event carrying an incremental progress update.
pub const ANALYSIS_PROGRESS_EVENT: &str = "analysis_progress";

/// One event as delivered by the push channel, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub name: String,
    pub channel: String,
    pub payload: serde_json::Value,
    /// Local receipt time, the recency fallback for unnumbered updates.
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(
        name: impl Into<String>,
        channel: impl Into<String>,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            payload,
            received_at,
        }
    }

    pub fn is_progress(&self) -> bool {
        self.name == ANALYSIS_PROGRESS_EVENT
    }
}

/// Input to the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Full authoritative record, pulled from the system of record.
    Snapshot(ProgressState),
    /// Incremental update, pushed by the channel.
    Event(RawEvent),
}
