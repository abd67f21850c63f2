//! `jobwire-streams`: durable, replayable per-job data streams.
//!
//! The crate is split in two layers:
//!
//! - a **substrate** ([`StreamStore`]) that stores ordered JSON entries per
//!   [`StreamId`](jobwire_core::StreamId), tracks completion and fans out new
//!   entries to live readers;
//! - a **typed handle** ([`Stream<T>`]) that validates values against their
//!   [`Schema`](jobwire_core::Schema), offloads large payloads to a
//!   [`StorageProvider`] and decodes entries back into `T` for subscribers.
//!
//! Substrates in this crate are in-memory; networked ones live in `jobwire-infra`.

pub mod entry;
pub mod in_memory;
pub mod storage;
pub mod store;
pub mod stream;
pub mod subscription;

pub use entry::{Datapoint, Payload, StreamEntry, StreamEvent};
pub use in_memory::InMemoryStreamStore;
pub use storage::{InMemoryStorage, StorageError, StorageProvider};
pub use store::{EntryFeed, ReadOrder, StartAt, StoreError, StreamStore};
pub use stream::{PayloadCodec, ReplayFrom, Stream, StreamError, StreamSettings};
pub use subscription::{Delivery, Subscription};
