//! Stream substrate abstraction.
//!
//! A [`StreamStore`] is the durable side of a stream: it assigns sequence
//! numbers, keeps history, remembers completion and hands out feeds to
//! readers. It deals in raw [`Payload`]s only; typing and validation happen
//! in [`Stream`](crate::Stream).
//!
//! ## Guarantees every implementation provides
//!
//! - Sequence numbers start at 1 and increase by one per accepted append.
//! - Appends after completion fail with [`StoreError::Closed`].
//! - A feed opened with [`StartAt::Beginning`] yields the retained history in
//!   order followed by every later entry, with no gap between the two.
//! - A feed yields [`StreamEvent::Completed`] once the stream is completed
//!   (immediately, if it already was).
//!
//! Delivery is at-least-once: a feed may repeat an entry after a reconnect.
//! Readers drop repeats by sequence number.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use thiserror::Error;

use jobwire_core::StreamId;

use crate::entry::{Payload, StreamEntry, StreamEvent};

/// Where a new feed starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Every retained entry, then live entries.
    Beginning,
    /// The most recent entry (if any), then live entries.
    Latest,
    /// Only entries appended after the feed was opened.
    Now,
    /// Entries with a sequence number greater than the given one.
    After(u64),
}

/// Order of a history read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("stream {0} is complete")]
    Closed(StreamId),

    #[error("stream backend error: {0}")]
    Backend(String),

    #[error("corrupt stream entry: {0}")]
    Corrupt(String),
}

/// Receiving side of a substrate feed.
///
/// Dropping the feed releases the substrate's resources for it: channel
/// fan-out prunes closed receivers, polling producers watch the cancel flag.
#[derive(Debug)]
pub struct EntryFeed {
    receiver: Receiver<StreamEvent>,
    cancelled: Option<Arc<AtomicBool>>,
}

impl EntryFeed {
    pub fn new(receiver: Receiver<StreamEvent>) -> Self {
        Self {
            receiver,
            cancelled: None,
        }
    }

    /// Feed whose producer stops once `cancelled` is set on drop.
    pub fn with_cancel_flag(receiver: Receiver<StreamEvent>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            receiver,
            cancelled: Some(cancelled),
        }
    }

    /// Block until the next event is available.
    pub fn recv(&self) -> Result<StreamEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Result<StreamEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for an event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StreamEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for EntryFeed {
    fn drop(&mut self) {
        if let Some(flag) = &self.cancelled {
            flag.store(true, Ordering::Release);
        }
    }
}

pub trait StreamStore: Send + Sync {
    /// Append a payload, returning the stored entry with its sequence number.
    fn append(&self, stream_id: &StreamId, payload: Payload) -> Result<StreamEntry, StoreError>;

    /// Most recent entry, if the stream has any.
    fn last(&self, stream_id: &StreamId) -> Result<Option<StreamEntry>, StoreError>;

    /// Mark the stream complete. Returns `true` if this call completed it.
    fn complete(&self, stream_id: &StreamId) -> Result<bool, StoreError>;

    fn is_complete(&self, stream_id: &StreamId) -> Result<bool, StoreError>;

    /// Up to `limit` retained entries, oldest-first or newest-first.
    fn read(
        &self,
        stream_id: &StreamId,
        order: ReadOrder,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Open a feed on the stream.
    fn open(&self, stream_id: &StreamId, start: StartAt) -> Result<EntryFeed, StoreError>;
}

impl<S> StreamStore for Arc<S>
where
    S: StreamStore + ?Sized,
{
    fn append(&self, stream_id: &StreamId, payload: Payload) -> Result<StreamEntry, StoreError> {
        (**self).append(stream_id, payload)
    }

    fn last(&self, stream_id: &StreamId) -> Result<Option<StreamEntry>, StoreError> {
        (**self).last(stream_id)
    }

    fn complete(&self, stream_id: &StreamId) -> Result<bool, StoreError> {
        (**self).complete(stream_id)
    }

    fn is_complete(&self, stream_id: &StreamId) -> Result<bool, StoreError> {
        (**self).is_complete(stream_id)
    }

    fn read(
        &self,
        stream_id: &StreamId,
        order: ReadOrder,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).read(stream_id, order, limit)
    }

    fn open(&self, stream_id: &StreamId, start: StartAt) -> Result<EntryFeed, StoreError> {
        (**self).open(stream_id, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn dropping_a_feed_raises_its_cancel_flag() {
        let (_tx, rx) = mpsc::channel();
        let flag = Arc::new(AtomicBool::new(false));
        let feed = EntryFeed::with_cancel_flag(rx, flag.clone());

        assert!(!flag.load(Ordering::Acquire));
        drop(feed);
        assert!(flag.load(Ordering::Acquire));
    }
}
