//! In-memory stream substrate for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, mpsc};

use chrono::Utc;

use jobwire_core::StreamId;

use crate::entry::{Payload, StreamEntry, StreamEvent};
use crate::store::{EntryFeed, ReadOrder, StartAt, StoreError, StreamStore};

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    last_sequence: u64,
    completed: bool,
    subscribers: Vec<mpsc::Sender<StreamEvent>>,
}

/// In-memory stream substrate.
///
/// - No IO / no async
/// - History, completion and live fan-out share one lock, so a feed never
///   misses an entry appended while it is being opened
/// - History is optionally capped; the latest entry is always retained
#[derive(Debug, Default)]
pub struct InMemoryStreamStore {
    streams: Mutex<HashMap<StreamId, StreamState>>,
    max_history: Option<usize>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_history` entries per stream (minimum 1).
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            max_history: Some(max_history.max(1)),
        }
    }

    /// Ids of every stream that has been written to or opened, sorted.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = match self.streams.lock() {
            Ok(streams) => streams.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        ids.sort();
        ids
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<StreamId, StreamState>>, StoreError> {
        self.streams
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

impl StreamStore for InMemoryStreamStore {
    fn append(&self, stream_id: &StreamId, payload: Payload) -> Result<StreamEntry, StoreError> {
        let mut streams = self.lock()?;
        let state = streams.entry(stream_id.clone()).or_default();

        if state.completed {
            return Err(StoreError::Closed(stream_id.clone()));
        }

        state.last_sequence += 1;
        let entry = StreamEntry {
            sequence: state.last_sequence,
            published_at: Utc::now(),
            payload,
        };

        state.entries.push_back(entry.clone());
        if let Some(max) = self.max_history {
            while state.entries.len() > max {
                state.entries.pop_front();
            }
        }

        // Drop any dead subscribers while publishing.
        state
            .subscribers
            .retain(|tx| tx.send(StreamEvent::Entry(entry.clone())).is_ok());

        Ok(entry)
    }

    fn last(&self, stream_id: &StreamId) -> Result<Option<StreamEntry>, StoreError> {
        let streams = self.lock()?;
        Ok(streams.get(stream_id).and_then(|s| s.entries.back().cloned()))
    }

    fn complete(&self, stream_id: &StreamId) -> Result<bool, StoreError> {
        let mut streams = self.lock()?;
        let state = streams.entry(stream_id.clone()).or_default();

        if state.completed {
            return Ok(false);
        }
        state.completed = true;

        for tx in state.subscribers.drain(..) {
            let _ = tx.send(StreamEvent::Completed);
        }

        Ok(true)
    }

    fn is_complete(&self, stream_id: &StreamId) -> Result<bool, StoreError> {
        let streams = self.lock()?;
        Ok(streams.get(stream_id).is_some_and(|s| s.completed))
    }

    fn read(
        &self,
        stream_id: &StreamId,
        order: ReadOrder,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let streams = self.lock()?;
        let Some(state) = streams.get(stream_id) else {
            return Ok(Vec::new());
        };

        Ok(match order {
            ReadOrder::Ascending => state.entries.iter().take(limit).cloned().collect(),
            ReadOrder::Descending => state.entries.iter().rev().take(limit).cloned().collect(),
        })
    }

    fn open(&self, stream_id: &StreamId, start: StartAt) -> Result<EntryFeed, StoreError> {
        let (tx, rx) = mpsc::channel();

        let mut streams = self.lock()?;
        let state = streams.entry(stream_id.clone()).or_default();

        let backlog: Vec<&StreamEntry> = match start {
            StartAt::Beginning => state.entries.iter().collect(),
            StartAt::Latest => state.entries.back().into_iter().collect(),
            StartAt::Now => Vec::new(),
            StartAt::After(sequence) => state
                .entries
                .iter()
                .filter(|e| e.sequence > sequence)
                .collect(),
        };

        // The receiver is still in scope, so these sends cannot fail.
        for entry in backlog {
            let _ = tx.send(StreamEvent::Entry(entry.clone()));
        }

        if state.completed {
            let _ = tx.send(StreamEvent::Completed);
        } else {
            state.subscribers.push(tx);
        }

        Ok(EntryFeed::new(rx))
    }
}
