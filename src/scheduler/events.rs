//! Append-only, bounded per-job event log with streaming replay.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{EventBufferConfig, OverflowPolicy};
use crate::proto;

/// Events buffered between the log and a slow stream consumer.
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<proto::LogLevel> for LogLevel {
    fn from(level: proto::LogLevel) -> Self {
        match level {
            proto::LogLevel::Trace => LogLevel::Trace,
            proto::LogLevel::Debug => LogLevel::Debug,
            proto::LogLevel::Info => LogLevel::Info,
            proto::LogLevel::Warn => LogLevel::Warn,
            proto::LogLevel::Error => LogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Parse,
    Provision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Starts at 1, strictly increasing and gap-free per job.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: EventSource,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Buffer {
    events: VecDeque<LogEvent>,
    next_sequence: u64,
    /// Events evicted by `DropOldest`.
    discarded: u64,
    closed: bool,
    /// Last sequence each live stream has delivered, keyed by stream id.
    cursors: HashMap<u64, u64>,
    next_stream: u64,
    /// Highest sequence any stream has delivered.
    delivered: u64,
}

impl Buffer {
    /// Events the slowest live stream has yet to deliver. With no stream
    /// attached, events past the furthest delivery so far.
    fn undelivered(&self) -> usize {
        let floor = self
            .cursors
            .values()
            .copied()
            .min()
            .unwrap_or(self.delivered);
        let lag = (self.next_sequence - 1).saturating_sub(floor);
        usize::try_from(lag).unwrap_or(usize::MAX)
    }

    fn is_full(&self, capacity: usize, policy: OverflowPolicy) -> bool {
        match policy {
            OverflowPolicy::DropOldest => self.events.len() >= capacity,
            OverflowPolicy::Block => self.undelivered() >= capacity,
        }
    }
}

/// The event sequence attached to one job.
///
/// Appends come from exactly one session read loop, so ordering is the
/// order the worker produced events in. Readers never hold the internal
/// lock across an await.
///
/// Under [`OverflowPolicy::DropOldest`] `capacity` bounds the retained
/// events. Under [`OverflowPolicy::Block`] every event is retained and
/// `capacity` bounds how far appends may run ahead of the slowest stream.
#[derive(Debug)]
pub struct EventLog {
    buffer: Mutex<Buffer>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Bumped on every append and on close.
    appended: watch::Sender<u64>,
    /// Signalled when a stream delivers, detaches, or the log closes.
    released: Notify,
}

impl EventLog {
    pub fn new(config: &EventBufferConfig) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            buffer: Mutex::new(Buffer {
                events: VecDeque::new(),
                next_sequence: 1,
                discarded: 0,
                closed: false,
                cursors: HashMap::new(),
                next_stream: 0,
                delivered: 0,
            }),
            capacity: config.capacity.max(1),
            policy: config.policy,
            appended,
            released: Notify::new(),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        // A panic while holding the lock cannot leave the buffer half
        // updated, so a poisoned lock is still usable.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and return its sequence number, or `None` if the
    /// log is already closed.
    ///
    /// Under [`OverflowPolicy::Block`] this waits until the slowest stream
    /// is less than `capacity` events behind.
    pub async fn append(
        &self,
        level: LogLevel,
        source: EventSource,
        message: String,
        fields: BTreeMap<String, String>,
    ) -> Option<u64> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut buffer = self.buffer();
                if buffer.closed {
                    return None;
                }
                let full = buffer.is_full(self.capacity, self.policy);
                if !full || self.policy == OverflowPolicy::DropOldest {
                    if full {
                        buffer.events.pop_front();
                        buffer.discarded += 1;
                    }
                    let sequence = buffer.next_sequence;
                    buffer.next_sequence += 1;
                    buffer.events.push_back(LogEvent {
                        sequence,
                        timestamp: Utc::now(),
                        level,
                        source,
                        message,
                        fields,
                    });
                    drop(buffer);
                    self.appended.send_replace(sequence);
                    return Some(sequence);
                }
            }

            released.await;
        }
    }

    /// Append a log line received from a worker.
    pub async fn append_proto(&self, source: EventSource, log: proto::Log) -> Option<u64> {
        let level = LogLevel::from(log.level());
        let fields = log.fields.into_iter().collect();
        self.append(level, source, log.output, fields).await
    }

    /// Mark the log finished. Streams end once they have drained it and
    /// blocked appenders give up.
    pub fn close(&self) {
        let last = {
            let mut buffer = self.buffer();
            buffer.closed = true;
            buffer.next_sequence - 1
        };
        self.appended.send_replace(last);
        self.released.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.buffer().closed
    }

    /// Copy of every retained event.
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.buffer().events.iter().cloned().collect()
    }

    /// Number of events retained in memory.
    pub fn len(&self) -> usize {
        self.buffer().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().events.is_empty()
    }

    /// Sequence number of the last appended event, 0 if none.
    pub fn last_sequence(&self) -> u64 {
        self.buffer().next_sequence - 1
    }

    /// Events no longer retained in memory.
    pub fn discarded(&self) -> u64 {
        self.buffer().discarded
    }

    /// Retained events with `sequence >= from`, and whether the log was
    /// closed when they were read. A `from` older than the oldest retained
    /// event starts at the oldest retained event.
    pub fn read_from(&self, from: u64) -> (Vec<LogEvent>, bool) {
        let buffer = self.buffer();
        let events = buffer
            .events
            .iter()
            .filter(|e| e.sequence >= from)
            .cloned()
            .collect();
        (events, buffer.closed)
    }

    fn attach(self: &Arc<Self>, from_sequence: u64) -> StreamCursor {
        let mut buffer = self.buffer();
        let id = buffer.next_stream;
        buffer.next_stream += 1;
        buffer.cursors.insert(id, from_sequence.saturating_sub(1));
        StreamCursor {
            log: Arc::clone(self),
            id,
        }
    }

    fn delivered(&self, id: u64, sequence: u64) {
        {
            let mut buffer = self.buffer();
            if let Some(cursor) = buffer.cursors.get_mut(&id) {
                *cursor = sequence;
            }
            buffer.delivered = buffer.delivered.max(sequence);
        }
        self.released.notify_waiters();
    }

    fn detach(&self, id: u64) {
        self.buffer().cursors.remove(&id);
        self.released.notify_waiters();
    }

    /// Lazily stream events starting at `from_sequence`.
    ///
    /// The stream follows new appends and ends once the log is closed and
    /// fully drained. Streams never remove events, so any number of them
    /// may replay the log concurrently.
    pub fn stream(self: &Arc<Self>, from_sequence: u64) -> ReceiverStream<LogEvent> {
        let log = Arc::clone(self);
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let from_sequence = from_sequence.max(1);
        let cursor = self.attach(from_sequence);

        tokio::spawn(async move {
            let mut changes = log.appended.subscribe();
            let mut next = from_sequence;

            loop {
                changes.borrow_and_update();
                let (batch, closed) = log.read_from(next);

                for event in batch {
                    let sequence = event.sequence;
                    if tx.send(event).await.is_err() {
                        // Consumer went away
                        return;
                    }
                    next = sequence + 1;
                    cursor.advance(sequence);
                }

                if closed {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

/// Position of one live stream. Dropping it stops the stream from holding
/// back appenders.
#[derive(Debug)]
struct StreamCursor {
    log: Arc<EventLog>,
    id: u64,
}

impl StreamCursor {
    fn advance(&self, sequence: u64) {
        self.log.delivered(self.id, sequence);
    }
}

impl Drop for StreamCursor {
    fn drop(&mut self) {
        self.log.detach(self.id);
    }
}
