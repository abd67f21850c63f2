//! Redis-backed stream substrate (durable, replayable, shared across processes).
//!
//! ## Layout
//!
//! Every stream id maps to four keys under `{prefix}:{stream_id}`:
//!
//! - `:log`  Redis Stream holding the history. Entry ids are `{sequence}-0`;
//!   the completion marker is written as `{last sequence}-1`.
//! - `:seq`  last assigned sequence number (INCR)
//! - `:last` hash with the latest entry; survives `MAXLEN` trimming of the log
//! - `:done` completion flag
//!
//! Appends and completion each run as one Lua script, so sequence
//! assignment, the completion check, the log write and the latest-value
//! update happen atomically per stream.
//!
//! ## Live delivery
//!
//! A feed is a background thread doing `XREAD BLOCK` on the log from a
//! cursor, on its own connection. Publishers never wait on readers. After a
//! connection error the thread reconnects and resumes from its cursor, so a
//! reader sees no gaps; redelivery is possible and dropped downstream by
//! sequence number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::Commands;
use redis::streams::{StreamId as RawEntry, StreamRangeReply, StreamReadOptions, StreamReadReply};
use tracing::{debug, instrument, warn};

use jobwire_core::StreamId;
use jobwire_streams::{
    EntryFeed, Payload, ReadOrder, StartAt, StoreError, StreamEntry, StreamEvent, StreamStore,
};

/// Default key prefix
const DEFAULT_PREFIX: &str = "jobwire";

/// How long a feed blocks in XREAD before re-checking for cancellation.
const DEFAULT_BLOCK_MS: usize = 1000;

/// Entries fetched per XREAD round trip.
const READ_BATCH: usize = 100;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

const APPEND_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[4]) == 1 then
  return redis.error_reply('CLOSED stream is complete')
end
local seq = redis.call('INCR', KEYS[2])
local id = seq .. '-0'
if ARGV[3] == '' then
  redis.call('XADD', KEYS[1], id, 'kind', 'entry', 'at', ARGV[2], 'payload', ARGV[1])
else
  redis.call('XADD', KEYS[1], 'MAXLEN', '~', ARGV[3], id, 'kind', 'entry', 'at', ARGV[2], 'payload', ARGV[1])
end
redis.call('HSET', KEYS[3], 'seq', seq, 'at', ARGV[2], 'payload', ARGV[1])
return seq
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[3], '1', 'NX') then
  local seq = tonumber(redis.call('GET', KEYS[2]) or '0')
  redis.call('XADD', KEYS[1], seq .. '-1', 'kind', 'end')
  return 1
end
return 0
"#;

struct Keys {
    log: String,
    seq: String,
    last: String,
    done: String,
}

#[derive(Debug, Clone)]
pub struct RedisStreamStore {
    client: Arc<redis::Client>,
    prefix: String,
    max_len: Option<usize>,
    block_ms: usize,
    append_script: redis::Script,
    complete_script: redis::Script,
}

impl RedisStreamStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// `max_len` approximately caps each stream's retained history.
    pub fn new(redis_url: impl AsRef<str>, max_len: Option<usize>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| backend("open client", e))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            max_len,
            block_ms: DEFAULT_BLOCK_MS,
            append_script: redis::Script::new(APPEND_SCRIPT),
            complete_script: redis::Script::new(COMPLETE_SCRIPT),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_block_ms(mut self, block_ms: usize) -> Self {
        self.block_ms = block_ms.max(1);
        self
    }

    /// Check that the server is reachable.
    pub fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(|e| backend("PING", e))?;
        Ok(())
    }

    fn keys(&self, stream_id: &StreamId) -> Keys {
        let base = format!("{}:{}", self.prefix, stream_id);
        Keys {
            log: format!("{base}:log"),
            seq: format!("{base}:seq"),
            last: format!("{base}:last"),
            done: format!("{base}:done"),
        }
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client.get_connection().map_err(|e| backend("connect", e))
    }

    fn current_sequence(&self, conn: &mut redis::Connection, keys: &Keys) -> Result<u64, StoreError> {
        let seq: Option<u64> = conn.get(&keys.seq).map_err(|e| backend("GET seq", e))?;
        Ok(seq.unwrap_or(0))
    }
}

impl StreamStore for RedisStreamStore {
    #[instrument(skip(self, payload), fields(stream_id = %stream_id), err)]
    fn append(&self, stream_id: &StreamId, payload: Payload) -> Result<StreamEntry, StoreError> {
        let keys = self.keys(stream_id);
        let published_at = Utc::now();
        let encoded = serde_json::to_string(&payload)
            .map_err(|e| StoreError::Corrupt(format!("cannot encode payload: {e}")))?;
        let max_len = self.max_len.map(|n| n.max(1).to_string()).unwrap_or_default();

        let mut conn = self.connection()?;
        let result: redis::RedisResult<u64> = self
            .append_script
            .key(&keys.log)
            .key(&keys.seq)
            .key(&keys.last)
            .key(&keys.done)
            .arg(&encoded)
            .arg(published_at.to_rfc3339())
            .arg(max_len)
            .invoke(&mut conn);

        match result {
            Ok(sequence) => Ok(StreamEntry {
                sequence,
                published_at,
                payload,
            }),
            Err(err) if err.code() == Some("CLOSED") => Err(StoreError::Closed(stream_id.clone())),
            Err(err) => Err(backend("append", err)),
        }
    }

    fn last(&self, stream_id: &StreamId) -> Result<Option<StreamEntry>, StoreError> {
        let keys = self.keys(stream_id);
        let mut conn = self.connection()?;
        let fields: HashMap<String, String> =
            conn.hgetall(&keys.last).map_err(|e| backend("HGETALL last", e))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let sequence = fields
            .get("seq")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Corrupt(format!("{stream_id}: latest entry has no sequence")))?;
        let entry = decode_entry(
            stream_id,
            sequence,
            fields.get("at").map(String::as_str),
            fields.get("payload").map(String::as_str),
        )?;
        Ok(Some(entry))
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    fn complete(&self, stream_id: &StreamId) -> Result<bool, StoreError> {
        let keys = self.keys(stream_id);
        let mut conn = self.connection()?;
        let completed: i64 = self
            .complete_script
            .key(&keys.log)
            .key(&keys.seq)
            .key(&keys.done)
            .invoke(&mut conn)
            .map_err(|e| backend("complete", e))?;
        Ok(completed == 1)
    }

    fn is_complete(&self, stream_id: &StreamId) -> Result<bool, StoreError> {
        let keys = self.keys(stream_id);
        let mut conn = self.connection()?;
        conn.exists(&keys.done).map_err(|e| backend("EXISTS done", e))
    }

    fn read(
        &self,
        stream_id: &StreamId,
        order: ReadOrder,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.keys(stream_id);
        let mut conn = self.connection()?;

        // One extra so a trailing completion marker does not eat into `limit`.
        let count = limit + 1;
        let reply: redis::RedisResult<StreamRangeReply> = match order {
            ReadOrder::Ascending => conn.xrange_count(&keys.log, "-", "+", count),
            ReadOrder::Descending => conn.xrevrange_count(&keys.log, "+", "-", count),
        };
        let reply = reply.map_err(|e| backend("XRANGE", e))?;

        let mut entries = Vec::with_capacity(limit);
        for raw in &reply.ids {
            if let StreamEvent::Entry(entry) = parse_event(stream_id, raw)? {
                entries.push(entry);
                if entries.len() == limit {
                    break;
                }
            }
        }
        Ok(entries)
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    fn open(&self, stream_id: &StreamId, start: StartAt) -> Result<EntryFeed, StoreError> {
        let keys = self.keys(stream_id);

        let mut skip_through = 0;
        let cursor = match start {
            StartAt::Beginning => "0-0".to_string(),
            StartAt::After(sequence) => {
                // The cursor never passes the head, so a completion marker
                // at `{head}-1` is still read when `sequence` is beyond it.
                let mut conn = self.connection()?;
                let head = self.current_sequence(&mut conn, &keys)?;
                skip_through = sequence;
                format!("{}-0", sequence.min(head))
            }
            StartAt::Now => {
                let mut conn = self.connection()?;
                format!("{}-0", self.current_sequence(&mut conn, &keys)?)
            }
            StartAt::Latest => {
                let mut conn = self.connection()?;
                match self.current_sequence(&mut conn, &keys)? {
                    0 => "0-0".to_string(),
                    // Just below `{seq}-0`, so the latest entry is included.
                    seq => format!("{}-1", seq - 1),
                }
            }
        };

        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let reader = FeedReader {
            client: Arc::clone(&self.client),
            stream_id: stream_id.clone(),
            log_key: keys.log,
            cursor,
            skip_through,
            block_ms: self.block_ms,
            cancelled: Arc::clone(&cancelled),
        };

        thread::Builder::new()
            .name("jobwire-redis-feed".to_string())
            .spawn(move || reader.run(tx))
            .map_err(|e| StoreError::Backend(format!("cannot spawn feed reader: {e}")))?;

        debug!(?start, "feed opened");
        Ok(EntryFeed::with_cancel_flag(rx, cancelled))
    }
}

/// Background reader behind one feed.
struct FeedReader {
    client: Arc<redis::Client>,
    stream_id: StreamId,
    log_key: String,
    cursor: String,
    /// Entries at or below this sequence are dropped.
    skip_through: u64,
    block_ms: usize,
    cancelled: Arc<AtomicBool>,
}

impl FeedReader {
    fn run(mut self, tx: mpsc::Sender<StreamEvent>) {
        let mut conn: Option<redis::Connection> = None;
        let mut backoff = INITIAL_BACKOFF;

        while !self.cancelled.load(Ordering::Acquire) {
            if conn.is_none() {
                match self.client.get_connection() {
                    Ok(c) => conn = Some(c),
                    Err(err) => {
                        warn!(stream_id = %self.stream_id, error = %err, "feed cannot connect; retrying");
                        thread::sleep(backoff);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else {
                continue;
            };

            let options = StreamReadOptions::default()
                .block(self.block_ms)
                .count(READ_BATCH);
            let reply: redis::RedisResult<Option<StreamReadReply>> =
                c.xread_options(&[&self.log_key], &[&self.cursor], &options);

            match reply {
                Ok(reply) => {
                    backoff = INITIAL_BACKOFF;
                    let raw_entries = reply
                        .into_iter()
                        .flat_map(|r| r.keys)
                        .flat_map(|k| k.ids);

                    for raw in raw_entries {
                        self.cursor = raw.id.clone();
                        match parse_event(&self.stream_id, &raw) {
                            Ok(StreamEvent::Entry(entry)) if entry.sequence <= self.skip_through => {}
                            Ok(event) => {
                                let finished = matches!(event, StreamEvent::Completed);
                                if tx.send(event).is_err() || finished {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!(stream_id = %self.stream_id, id = %raw.id, error = %err, "skipping unreadable stream entry");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(stream_id = %self.stream_id, error = %err, "stream read failed; reconnecting");
                    conn = None;
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

fn parse_event(stream_id: &StreamId, raw: &RawEntry) -> Result<StreamEvent, StoreError> {
    let kind: String = raw
        .get("kind")
        .ok_or_else(|| StoreError::Corrupt(format!("{stream_id}/{}: missing kind", raw.id)))?;

    match kind.as_str() {
        "end" => Ok(StreamEvent::Completed),
        "entry" => {
            let sequence = parse_sequence(&raw.id)
                .ok_or_else(|| StoreError::Corrupt(format!("{stream_id}: bad entry id {}", raw.id)))?;
            let at: Option<String> = raw.get("at");
            let payload: Option<String> = raw.get("payload");
            decode_entry(stream_id, sequence, at.as_deref(), payload.as_deref()).map(StreamEvent::Entry)
        }
        other => Err(StoreError::Corrupt(format!(
            "{stream_id}/{}: unknown kind {other:?}",
            raw.id
        ))),
    }
}

fn decode_entry(
    stream_id: &StreamId,
    sequence: u64,
    at: Option<&str>,
    payload: Option<&str>,
) -> Result<StreamEntry, StoreError> {
    let at = at.ok_or_else(|| StoreError::Corrupt(format!("{stream_id}#{sequence}: missing timestamp")))?;
    let payload = payload.ok_or_else(|| StoreError::Corrupt(format!("{stream_id}#{sequence}: missing payload")))?;

    let published_at = DateTime::parse_from_rfc3339(at)
        .map_err(|e| StoreError::Corrupt(format!("{stream_id}#{sequence}: bad timestamp: {e}")))?
        .with_timezone(&Utc);
    let payload: Payload = serde_json::from_str(payload)
        .map_err(|e| StoreError::Corrupt(format!("{stream_id}#{sequence}: bad payload: {e}")))?;

    Ok(StreamEntry {
        sequence,
        published_at,
        payload,
    })
}

/// `{sequence}-{n}` -> sequence
fn parse_sequence(id: &str) -> Option<u64> {
    id.split_once('-').and_then(|(ms, _)| ms.parse().ok())
}

fn backend(operation: &str, err: redis::RedisError) -> StoreError {
    StoreError::Backend(format!("redis {operation} failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_ids_map_to_sequences() {
        assert_eq!(parse_sequence("42-0"), Some(42));
        assert_eq!(parse_sequence("7-1"), Some(7));
        assert_eq!(parse_sequence("garbage"), None);
    }

    #[test]
    fn entries_decode_from_stored_fields() {
        let payload = serde_json::to_string(&Payload::inline(json!({"status": "done"}))).unwrap();
        let entry = decode_entry(
            &StreamId::from_raw("p/s/j/output"),
            3,
            Some("2024-05-01T12:00:00+00:00"),
            Some(&payload),
        )
        .unwrap();

        assert_eq!(entry.sequence, 3);
        assert_eq!(entry.payload, Payload::inline(json!({"status": "done"})));
    }

    #[test]
    fn missing_fields_are_corrupt() {
        let err = decode_entry(&StreamId::from_raw("s"), 1, None, Some("{}")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    /// Live tests need a server: `REDIS_URL=redis://localhost:6379 cargo test --features redis`.
    fn live_store() -> Option<RedisStreamStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!("jobwire-test-{}", uuid::Uuid::now_v7());
        Some(
            RedisStreamStore::new(url, None)
                .ok()?
                .with_prefix(prefix)
                .with_block_ms(50),
        )
    }

    fn sid() -> StreamId {
        StreamId::from_raw("proj/transcode/job-1/output")
    }

    #[test]
    fn live_append_read_and_complete() {
        let Some(store) = live_store() else {
            eprintln!("REDIS_URL not set; skipping");
            return;
        };

        assert!(store.last(&sid()).unwrap().is_none());
        for n in 1..=3 {
            let entry = store.append(&sid(), Payload::inline(json!(n))).unwrap();
            assert_eq!(entry.sequence, n);
        }
        assert_eq!(store.last(&sid()).unwrap().unwrap().payload, Payload::inline(json!(3)));

        assert!(store.complete(&sid()).unwrap());
        assert!(!store.complete(&sid()).unwrap());
        assert!(store.is_complete(&sid()).unwrap());
        assert!(matches!(
            store.append(&sid(), Payload::inline(json!(4))),
            Err(StoreError::Closed(_))
        ));

        let newest = store.read(&sid(), ReadOrder::Descending, 2).unwrap();
        assert_eq!(newest.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn live_feed_replays_then_follows() {
        let Some(store) = live_store() else {
            eprintln!("REDIS_URL not set; skipping");
            return;
        };

        store.append(&sid(), Payload::inline(json!("a"))).unwrap();
        let feed = store.open(&sid(), StartAt::Beginning).unwrap();
        store.append(&sid(), Payload::inline(json!("b"))).unwrap();
        store.complete(&sid()).unwrap();

        let mut sequences = Vec::new();
        loop {
            match feed.recv_timeout(Duration::from_secs(5)).unwrap() {
                StreamEvent::Entry(entry) => sequences.push(entry.sequence),
                StreamEvent::Completed => break,
            }
        }
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn live_resume_past_the_end_of_a_completed_stream_sees_completion() {
        let Some(store) = live_store() else {
            eprintln!("REDIS_URL not set; skipping");
            return;
        };

        store.append(&sid(), Payload::inline(json!(1))).unwrap();
        store.append(&sid(), Payload::inline(json!(2))).unwrap();
        store.complete(&sid()).unwrap();

        let feed = store.open(&sid(), StartAt::After(5)).unwrap();
        assert_eq!(
            feed.recv_timeout(Duration::from_secs(5)).unwrap(),
            StreamEvent::Completed
        );
    }

    #[test]
    fn live_resume_ahead_of_the_head_skips_to_the_requested_sequence() {
        let Some(store) = live_store() else {
            eprintln!("REDIS_URL not set; skipping");
            return;
        };

        store.append(&sid(), Payload::inline(json!(1))).unwrap();
        let feed = store.open(&sid(), StartAt::After(3)).unwrap();
        for n in 2..=5 {
            store.append(&sid(), Payload::inline(json!(n))).unwrap();
        }
        store.complete(&sid()).unwrap();

        let mut sequences = Vec::new();
        loop {
            match feed.recv_timeout(Duration::from_secs(5)).unwrap() {
                StreamEvent::Entry(entry) => sequences.push(entry.sequence),
                StreamEvent::Completed => break,
            }
        }
        assert_eq!(sequences, vec![4, 5]);
    }
}
