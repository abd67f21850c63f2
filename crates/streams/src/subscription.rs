//! Typed subscriptions over a substrate feed.
//!
//! A subscription is consumed from a single thread. It drops entries whose
//! sequence number it has already delivered, so substrate redelivery never
//! reaches the caller twice. Dropping the subscription cancels it.
//!
//! ```ignore
//! let mut sub = stream.replay(ReplayFrom::Beginning)?;
//! loop {
//!     match sub.recv_timeout(Duration::from_secs(1))? {
//!         Some(Delivery::Value(point)) => process(point.value)?,
//!         Some(Delivery::Completed) => break,
//!         None => continue, // check for shutdown
//!     }
//! }
//! ```

use std::marker::PhantomData;
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::trace;

use jobwire_core::StreamId;

use crate::entry::{Datapoint, StreamEvent};
use crate::store::EntryFeed;
use crate::stream::{PayloadCodec, StreamError};

/// One step of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    Value(Datapoint<T>),
    /// The stream was completed; later calls keep returning this.
    Completed,
}

#[derive(Debug)]
pub struct Subscription<T> {
    stream_id: StreamId,
    feed: EntryFeed,
    codec: PayloadCodec,
    last_sequence: Option<u64>,
    completed: bool,
    disconnected: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    pub fn new(stream_id: StreamId, feed: EntryFeed, codec: PayloadCodec) -> Self {
        Self {
            stream_id,
            feed,
            codec,
            last_sequence: None,
            completed: false,
            disconnected: false,
            _marker: PhantomData,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Sequence number of the last delivered value.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Block until the next value or completion.
    pub fn recv(&mut self) -> Result<Delivery<T>, StreamError> {
        if self.completed {
            return Ok(Delivery::Completed);
        }
        loop {
            let event = self.feed.recv().map_err(|_| self.disconnect())?;
            if let Some(delivery) = self.accept(event)? {
                return Ok(delivery);
            }
        }
    }

    /// Block for up to `timeout`. `Ok(None)` means nothing arrived in time.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery<T>>, StreamError> {
        if self.completed {
            return Ok(Some(Delivery::Completed));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.feed.recv_timeout(remaining) {
                Ok(event) => {
                    if let Some(delivery) = self.accept(event)? {
                        return Ok(Some(delivery));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(self.disconnect()),
            }
        }
    }

    /// Return whatever is already buffered without blocking.
    pub fn try_recv(&mut self) -> Result<Option<Delivery<T>>, StreamError> {
        if self.completed {
            return Ok(Some(Delivery::Completed));
        }
        loop {
            match self.feed.try_recv() {
                Ok(event) => {
                    if let Some(delivery) = self.accept(event)? {
                        return Ok(Some(delivery));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(self.disconnect()),
            }
        }
    }

    fn accept(&mut self, event: StreamEvent) -> Result<Option<Delivery<T>>, StreamError> {
        match event {
            StreamEvent::Completed => {
                self.completed = true;
                Ok(Some(Delivery::Completed))
            }
            StreamEvent::Entry(entry) => {
                if self.last_sequence.is_some_and(|last| entry.sequence <= last) {
                    trace!(stream_id = %self.stream_id, sequence = entry.sequence, "skipping redelivered entry");
                    return Ok(None);
                }
                let sequence = entry.sequence;
                let value = self.codec.decode(&self.stream_id, entry.payload)?;
                self.last_sequence = Some(sequence);
                Ok(Some(Delivery::Value(Datapoint {
                    sequence,
                    published_at: entry.published_at,
                    value,
                })))
            }
        }
    }

    fn disconnect(&mut self) -> StreamError {
        self.disconnected = true;
        StreamError::Disconnected {
            stream_id: self.stream_id.clone(),
        }
    }
}

/// Iterates values until the stream completes.
///
/// Decode failures are yielded and iteration continues; a lost feed is
/// yielded once and ends iteration.
impl<T: DeserializeOwned> Iterator for Subscription<T> {
    type Item = Result<Datapoint<T>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.completed || self.disconnected {
            return None;
        }
        match self.recv() {
            Ok(Delivery::Value(point)) => Some(Ok(point)),
            Ok(Delivery::Completed) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Payload, StreamEntry};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::mpsc;

    fn entry(sequence: u64, value: i64) -> StreamEvent {
        StreamEvent::Entry(StreamEntry {
            sequence,
            published_at: Utc::now(),
            payload: Payload::inline(json!(value)),
        })
    }

    fn subscription(events: Vec<StreamEvent>, keep_open: bool) -> (Subscription<i64>, Option<mpsc::Sender<StreamEvent>>) {
        let (tx, rx) = mpsc::channel();
        for ev in events {
            tx.send(ev).unwrap();
        }
        let sub = Subscription::new(
            StreamId::from_raw("p/s/j/output"),
            EntryFeed::new(rx),
            PayloadCodec::inline_only(),
        );
        (sub, keep_open.then_some(tx))
    }

    #[test]
    fn redelivered_entries_are_skipped() {
        let (sub, _) = subscription(
            vec![entry(1, 10), entry(2, 20), entry(2, 20), entry(1, 10), entry(3, 30), StreamEvent::Completed],
            false,
        );

        let values: Vec<i64> = sub.map(|r| r.unwrap().value).collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn recv_timeout_returns_none_when_idle() {
        let (mut sub, _tx) = subscription(vec![], true);
        assert!(sub.recv_timeout(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn completion_is_sticky() {
        let (mut sub, _) = subscription(vec![StreamEvent::Completed], false);
        assert_eq!(sub.recv().unwrap(), Delivery::Completed);
        assert_eq!(sub.recv().unwrap(), Delivery::Completed);
        assert_eq!(sub.try_recv().unwrap(), Some(Delivery::Completed));
    }

    #[test]
    fn lost_feed_ends_iteration_with_an_error() {
        let (mut sub, _) = subscription(vec![entry(1, 1)], false);
        assert!(matches!(sub.next(), Some(Ok(_))));
        assert!(matches!(sub.next(), Some(Err(StreamError::Disconnected { .. }))));
        assert!(sub.next().is_none());
    }

    #[test]
    fn undecodable_entries_surface_as_errors() {
        let (tx, rx) = mpsc::channel();
        tx.send(StreamEvent::Entry(StreamEntry {
            sequence: 1,
            published_at: Utc::now(),
            payload: Payload::inline(json!("not a number")),
        }))
        .unwrap();
        tx.send(entry(2, 5)).unwrap();

        let mut sub: Subscription<i64> =
            Subscription::new(StreamId::from_raw("s"), EntryFeed::new(rx), PayloadCodec::inline_only());

        assert!(matches!(sub.try_recv(), Err(StreamError::Codec { .. })));
        assert!(matches!(sub.try_recv().unwrap(), Some(Delivery::Value(p)) if p.value == 5));
    }
}
