//! Bounded per-container log ring with subscriber fan-out.
//!
//! The ring keeps the most recent `capacity` bytes of a workload's merged
//! output as timestamped chunks. Appends and subscriber registration happen
//! under the same lock, so a subscriber receives the retained bytes as one
//! replay burst followed by every later append, with nothing lost or repeated
//! at the join.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Default retained bytes per container.
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// One retained chunk of output.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// When the chunk was captured.
    pub at: DateTime<Utc>,
    /// Raw bytes as emitted by the workload.
    pub data: Bytes,
}

/// A live subscription created by [`LogRing::subscribe`].
#[derive(Debug)]
pub struct LogSubscription {
    /// Ring contents at the moment of subscription.
    pub replay: Bytes,
    /// Every byte appended after the replay. Closed when the ring closes or
    /// the subscriber is removed.
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
}

#[derive(Debug)]
struct RingState {
    chunks: VecDeque<LogEntry>,
    len: usize,
    capacity: usize,
    subscribers: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    closed: bool,
}

/// Bounded byte ring plus subscriber set.
#[derive(Debug)]
pub struct LogRing {
    state: Mutex<RingState>,
}

impl LogRing {
    /// Creates an empty ring retaining at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                chunks: VecDeque::new(),
                len: 0,
                capacity: capacity.max(1),
                subscribers: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends output and forwards it to every live subscriber.
    ///
    /// Appends after [`close`](Self::close) are dropped.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let chunk = Bytes::copy_from_slice(data);
        state
            .subscribers
            .retain(|_, tx| tx.send(chunk.clone()).is_ok());

        let chunk = if chunk.len() > state.capacity {
            chunk.slice(chunk.len() - state.capacity..)
        } else {
            chunk
        };
        state.len += chunk.len();
        state.chunks.push_back(LogEntry {
            at: Utc::now(),
            data: chunk,
        });
        while state.len > state.capacity {
            let excess = state.len - state.capacity;
            let Some(front) = state.chunks.front_mut() else {
                break;
            };
            if front.data.len() <= excess {
                let removed = front.data.len();
                state.chunks.pop_front();
                state.len -= removed;
            } else {
                front.data = front.data.slice(excess..);
                state.len -= excess;
            }
        }
    }

    /// Returns the retained bytes.
    #[must_use]
    pub fn snapshot(&self) -> Bytes {
        let state = self.lock();
        concat(&state.chunks)
    }

    /// Returns the retained chunks with their capture times.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().chunks.iter().cloned().collect()
    }

    /// Registers a subscriber and returns the replay burst with its receiver.
    ///
    /// Subscribing to a closed ring yields the replay and an already closed
    /// receiver. Re-using an id replaces the previous subscriber.
    pub fn subscribe(&self, id: &str) -> LogSubscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let replay = concat(&state.chunks);
        if !state.closed {
            state.subscribers.insert(id.to_string(), tx);
        }
        LogSubscription { replay, receiver }
    }

    /// Like [`subscribe`](Self::subscribe), but returns the retained chunks
    /// with their capture times so the caller can render them.
    pub fn subscribe_entries(&self, id: &str) -> (Vec<LogEntry>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let entries = state.chunks.iter().cloned().collect();
        if !state.closed {
            state.subscribers.insert(id.to_string(), tx);
        }
        (entries, receiver)
    }

    /// Removes a subscriber, closing its channel.
    pub fn unsubscribe(&self, id: &str) {
        self.lock().subscribers.remove(id);
    }

    /// Closes the ring: every subscriber channel is closed and later appends
    /// are dropped. Retained bytes stay readable.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Retained byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

fn concat(chunks: &VecDeque<LogEntry>) -> Bytes {
    let total = chunks.iter().map(|c| c.data.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk.data);
    }
    buf.freeze()
}

/// Returns the suffix of `data` holding its last `lines` lines.
///
/// A trailing newline does not start an extra empty line.
#[must_use]
pub fn tail_lines(data: &[u8], lines: usize) -> &[u8] {
    if lines == 0 {
        return &[];
    }
    let body = data.strip_suffix(b"\n").unwrap_or(data);
    let mut seen = 0;
    for (i, byte) in body.iter().enumerate().rev() {
        if *byte == b'\n' {
            seen += 1;
            if seen == lines {
                return &data[i + 1..];
            }
        }
    }
    data
}

/// Options for rendering retained log entries.
#[derive(Debug, Clone, Default)]
pub struct LogRenderOptions {
    /// Prefix every line with the capture time of the chunk that started it.
    pub timestamps: bool,
    /// Drop chunks captured before this time.
    pub since: Option<DateTime<Utc>>,
    /// Drop chunks captured after this time.
    pub until: Option<DateTime<Utc>>,
    /// Keep only the last N lines.
    pub tail: Option<usize>,
}

/// Renders retained entries into the byte stream a log reader receives.
#[must_use]
pub fn render_entries(entries: &[LogEntry], opts: &LogRenderOptions) -> Bytes {
    let mut out = BytesMut::new();
    let mut line_start = true;
    for entry in entries {
        if opts.since.is_some_and(|since| entry.at < since)
            || opts.until.is_some_and(|until| entry.at > until)
        {
            continue;
        }
        if opts.timestamps {
            let stamp = entry.at.to_rfc3339_opts(SecondsFormat::Nanos, true);
            for piece in entry.data.split_inclusive(|b| *b == b'\n') {
                if line_start {
                    out.extend_from_slice(stamp.as_bytes());
                    out.extend_from_slice(b" ");
                }
                out.extend_from_slice(piece);
                line_start = piece.ends_with(b"\n");
            }
        } else {
            out.extend_from_slice(&entry.data);
        }
    }
    match opts.tail {
        Some(n) => Bytes::copy_from_slice(tail_lines(&out, n)),
        None => out.freeze(),
    }
}
