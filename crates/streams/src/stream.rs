//! Typed stream handle.
//!
//! A [`Stream<T>`] binds a [`StreamId`] to a substrate and a value schema.
//! Values are validated before they are written; entries are decoded back
//! into `T` when read. Handles are cheap to clone and every clone addresses
//! the same durable stream.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use jobwire_core::config::DEFAULT_OFFLOAD_THRESHOLD_BYTES;
use jobwire_core::{Schema, StreamId, ValidationError};

use crate::entry::{Datapoint, Payload, StreamEntry};
use crate::storage::{StorageError, StorageProvider};
use crate::store::{ReadOrder, StartAt, StoreError, StreamStore};
use crate::subscription::Subscription;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream {stream_id} is complete")]
    Closed { stream_id: StreamId },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cannot decode value on stream {stream_id}: {message}")]
    Codec { stream_id: StreamId, message: String },

    #[error("subscription to stream {stream_id} was disconnected")]
    Disconnected { stream_id: StreamId },
}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed(stream_id) => StreamError::Closed { stream_id },
            other => StreamError::Store(other),
        }
    }
}

/// Starting point of a replaying subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFrom {
    /// Every retained value, then live values.
    Beginning,
    /// The latest value (if any), then live values.
    Latest,
}

impl From<ReplayFrom> for StartAt {
    fn from(from: ReplayFrom) -> Self {
        match from {
            ReplayFrom::Beginning => StartAt::Beginning,
            ReplayFrom::Latest => StartAt::Latest,
        }
    }
}

/// Tunables shared by every stream of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Serialized values larger than this are offloaded when storage is available.
    pub offload_threshold_bytes: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            offload_threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
        }
    }
}

/// Converts JSON values to stream payloads and back, offloading large ones.
#[derive(Clone)]
pub struct PayloadCodec {
    storage: Option<Arc<dyn StorageProvider>>,
    offload_threshold_bytes: usize,
}

impl fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("has_storage", &self.storage.is_some())
            .field("offload_threshold_bytes", &self.offload_threshold_bytes)
            .finish()
    }
}

impl PayloadCodec {
    pub fn new(storage: Option<Arc<dyn StorageProvider>>, settings: StreamSettings) -> Self {
        Self {
            storage,
            offload_threshold_bytes: settings.offload_threshold_bytes,
        }
    }

    /// Codec that never offloads.
    pub fn inline_only() -> Self {
        Self::new(None, StreamSettings::default())
    }

    pub fn encode(&self, stream_id: &StreamId, value: JsonValue) -> Result<Payload, StreamError> {
        let Some(storage) = &self.storage else {
            return Ok(Payload::inline(value));
        };

        let bytes = serde_json::to_vec(&value).map_err(|e| StreamError::Codec {
            stream_id: stream_id.clone(),
            message: e.to_string(),
        })?;
        if bytes.len() <= self.offload_threshold_bytes {
            return Ok(Payload::inline(value));
        }

        let path = format!("{}/{}.json", stream_id, Uuid::now_v7());
        storage.put(&path, &bytes)?;
        debug!(%stream_id, %path, size = bytes.len(), "offloaded stream value");
        Ok(Payload::Blob { path })
    }

    pub fn decode<T: DeserializeOwned>(
        &self,
        stream_id: &StreamId,
        payload: Payload,
    ) -> Result<T, StreamError> {
        let codec_error = |message: String| StreamError::Codec {
            stream_id: stream_id.clone(),
            message,
        };

        match payload {
            Payload::Inline { value } => {
                serde_json::from_value(value).map_err(|e| codec_error(e.to_string()))
            }
            Payload::Blob { path } => {
                let storage = self
                    .storage
                    .as_ref()
                    .ok_or_else(|| StorageError::Unavailable(path.clone()))?;
                let bytes = storage.fetch(&path)?;
                serde_json::from_slice(&bytes).map_err(|e| codec_error(e.to_string()))
            }
        }
    }

    /// Best-effort removal of a blob whose entry was never written.
    fn discard(&self, path: &str) {
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.delete(path) {
                warn!(%path, error = %err, "failed to remove orphaned blob");
            }
        }
    }
}

pub struct Stream<T> {
    id: StreamId,
    store: Arc<dyn StreamStore>,
    codec: PayloadCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            store: Arc::clone(&self.store),
            codec: self.codec.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl<T: Schema> Stream<T> {
    pub fn new(id: StreamId, store: Arc<dyn StreamStore>, codec: PayloadCodec) -> Self {
        Self {
            id,
            store,
            codec,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Validate and append a value. Returns its sequence number.
    #[instrument(skip(self, value), fields(stream_id = %self.id), err)]
    pub fn publish(&self, value: &T) -> Result<u64, StreamError> {
        value.check()?;
        let json = value.to_json()?;

        if self.store.is_complete(&self.id)? {
            return Err(StreamError::Closed {
                stream_id: self.id.clone(),
            });
        }

        let payload = self.codec.encode(&self.id, json)?;
        let blob_path = match &payload {
            Payload::Blob { path } => Some(path.clone()),
            Payload::Inline { .. } => None,
        };

        match self.store.append(&self.id, payload) {
            Ok(entry) => {
                debug!(sequence = entry.sequence, offloaded = blob_path.is_some(), "published");
                Ok(entry.sequence)
            }
            Err(err) => {
                if let Some(path) = blob_path {
                    self.codec.discard(&path);
                }
                Err(err.into())
            }
        }
    }

    /// Most recently published value; `None` if nothing was published yet.
    pub fn get_last_value(&self) -> Result<Option<T>, StreamError> {
        self.store
            .last(&self.id)?
            .map(|entry| self.codec.decode(&self.id, entry.payload))
            .transpose()
    }

    /// Live subscription: only values published from now on.
    pub fn subscribe(&self) -> Result<Subscription<T>, StreamError> {
        self.open(StartAt::Now)
    }

    /// Subscription that first replays history, then continues live.
    pub fn replay(&self, from: ReplayFrom) -> Result<Subscription<T>, StreamError> {
        self.open(from.into())
    }

    /// Resume after the last sequence number a reader has processed.
    pub fn resume_after(&self, sequence: u64) -> Result<Subscription<T>, StreamError> {
        self.open(StartAt::After(sequence))
    }

    /// Close the stream. Completing an already complete stream is a no-op.
    #[instrument(skip(self), fields(stream_id = %self.id), err)]
    pub fn complete(&self) -> Result<(), StreamError> {
        if self.store.complete(&self.id)? {
            debug!("stream completed");
        }
        Ok(())
    }

    pub fn is_complete(&self) -> Result<bool, StreamError> {
        Ok(self.store.is_complete(&self.id)?)
    }

    /// Up to `limit` retained values in the given order.
    pub fn history(&self, order: ReadOrder, limit: usize) -> Result<Vec<Datapoint<T>>, StreamError> {
        self.store
            .read(&self.id, order, limit)?
            .into_iter()
            .map(|entry| self.datapoint(entry))
            .collect()
    }

    fn datapoint(&self, entry: StreamEntry) -> Result<Datapoint<T>, StreamError> {
        Ok(Datapoint {
            sequence: entry.sequence,
            published_at: entry.published_at,
            value: self.codec.decode(&self.id, entry.payload)?,
        })
    }

    fn open(&self, start: StartAt) -> Result<Subscription<T>, StreamError> {
        let feed = self.store.open(&self.id, start)?;
        Ok(Subscription::new(self.id.clone(), feed, self.codec.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStreamStore;
    use crate::storage::InMemoryStorage;
    use crate::subscription::Delivery;
    use jobwire_core::Violation;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Frame {
        index: u32,
        label: String,
    }

    impl Schema for Frame {
        fn validate(&self) -> Result<(), Vec<Violation>> {
            if self.label.is_empty() {
                return Err(vec![Violation::field("label", "must not be empty")]);
            }
            Ok(())
        }
    }

    fn frame(index: u32) -> Frame {
        Frame {
            index,
            label: format!("frame-{index}"),
        }
    }

    fn stream_with(codec: PayloadCodec) -> Stream<Frame> {
        Stream::new(
            StreamId::from_raw("proj/render/job-1/output"),
            Arc::new(InMemoryStreamStore::new()),
            codec,
        )
    }

    fn stream() -> Stream<Frame> {
        stream_with(PayloadCodec::inline_only())
    }

    #[test]
    fn last_value_is_none_until_something_is_published() {
        let s = stream();
        assert_eq!(s.get_last_value().unwrap(), None);

        s.publish(&frame(1)).unwrap();
        s.publish(&frame(2)).unwrap();
        assert_eq!(s.get_last_value().unwrap(), Some(frame(2)));
    }

    #[test]
    fn invalid_values_are_not_written() {
        let s = stream();
        let err = s
            .publish(&Frame {
                index: 1,
                label: String::new(),
            })
            .unwrap_err();

        assert!(matches!(err, StreamError::Validation(_)));
        assert!(s.history(ReadOrder::Ascending, 10).unwrap().is_empty());
    }

    #[test]
    fn publishing_to_a_completed_stream_fails() {
        let s = stream();
        s.publish(&frame(1)).unwrap();
        s.complete().unwrap();
        s.complete().unwrap();

        assert!(s.is_complete().unwrap());
        assert!(matches!(s.publish(&frame(2)), Err(StreamError::Closed { .. })));
    }

    #[test]
    fn live_subscription_sees_later_values_and_completion() {
        let s = stream();
        s.publish(&frame(1)).unwrap();

        let mut sub = s.subscribe().unwrap();
        s.publish(&frame(2)).unwrap();
        s.complete().unwrap();

        let values: Vec<Frame> = sub.by_ref().map(|r| r.unwrap().value).collect();
        assert_eq!(values, vec![frame(2)]);
        assert!(matches!(sub.recv().unwrap(), Delivery::Completed));
    }

    #[test]
    fn replay_from_latest_starts_with_the_last_value() {
        let s = stream();
        for i in 1..=3 {
            s.publish(&frame(i)).unwrap();
        }

        let mut sub = s.replay(ReplayFrom::Latest).unwrap();
        let first = sub.try_recv().unwrap();
        assert!(matches!(first, Some(Delivery::Value(dp)) if dp.value == frame(3)));
        assert!(sub.try_recv().unwrap().is_none());
    }

    #[test]
    fn resume_after_skips_processed_values() {
        let s = stream();
        for i in 1..=4 {
            s.publish(&frame(i)).unwrap();
        }
        s.complete().unwrap();

        let seqs: Vec<u64> = s
            .resume_after(2)
            .unwrap()
            .map(|r| r.unwrap().sequence)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn large_values_are_offloaded_when_storage_is_configured() {
        let storage = Arc::new(InMemoryStorage::new());
        let codec = PayloadCodec::new(
            Some(storage.clone()),
            StreamSettings {
                offload_threshold_bytes: 64,
            },
        );
        let s = stream_with(codec);

        let big = Frame {
            index: 7,
            label: "x".repeat(500),
        };
        s.publish(&frame(1)).unwrap();
        s.publish(&big).unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(s.get_last_value().unwrap(), Some(big.clone()));

        let values: Vec<Frame> = s
            .history(ReadOrder::Ascending, 10)
            .unwrap()
            .into_iter()
            .map(Datapoint::into_value)
            .collect();
        assert_eq!(values, vec![frame(1), big]);
    }

    #[test]
    fn large_values_stay_inline_without_storage() {
        let store = Arc::new(InMemoryStreamStore::new());
        let id = StreamId::from_raw("proj/render/job-1/output");
        let s: Stream<Frame> = Stream::new(id.clone(), store.clone(), PayloadCodec::inline_only());

        s.publish(&Frame {
            index: 1,
            label: "y".repeat(20_000),
        })
        .unwrap();

        let entry = store.last(&id).unwrap().unwrap();
        assert!(!entry.payload.is_blob());
    }

    #[test]
    fn blob_without_storage_is_a_decode_failure() {
        let codec = PayloadCodec::inline_only();
        let err = codec
            .decode::<Frame>(
                &StreamId::from_raw("s"),
                Payload::Blob {
                    path: "s/1.json".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, StreamError::Storage(StorageError::Unavailable(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn replay_from_beginning_preserves_publish_order(indices in proptest::collection::vec(0u32..1000, 0..40)) {
            let s = stream();
            for i in &indices {
                s.publish(&frame(*i)).unwrap();
            }
            s.complete().unwrap();

            let replayed: Vec<Datapoint<Frame>> = s
                .replay(ReplayFrom::Beginning)
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();

            let values: Vec<u32> = replayed.iter().map(|d| d.value.index).collect();
            prop_assert_eq!(values, indices.clone());

            let seqs: Vec<u64> = replayed.iter().map(|d| d.sequence).collect();
            let expected: Vec<u64> = (1..=indices.len() as u64).collect();
            prop_assert_eq!(seqs, expected);
        }
    }
}
