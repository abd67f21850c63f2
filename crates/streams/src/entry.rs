//! Stored stream entries and the values handed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Body of a stream entry.
///
/// Small values are stored inline; large ones are written to a
/// [`StorageProvider`](crate::StorageProvider) and only their path is kept
/// in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Inline { value: JsonValue },
    Blob { path: String },
}

impl Payload {
    pub fn inline(value: JsonValue) -> Self {
        Payload::Inline { value }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Payload::Blob { .. })
    }
}

/// One entry of a stream, as persisted by a substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Position in the stream, starting at 1 and strictly increasing.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub payload: Payload,
}

/// What a substrate feed delivers to a reader.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Entry(StreamEntry),
    /// The stream was completed; nothing follows.
    Completed,
}

/// A decoded value together with its stream position.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint<T> {
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub value: T,
}

impl<T> Datapoint<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}
