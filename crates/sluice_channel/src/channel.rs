//! Broadcast channel.
//!
//! One producer role pushes items; any number of [`Reader`]s observe every
//! item from the point they attached, each at its own pace. Items are kept in
//! a single buffer and evicted once the slowest reader has passed them.

use crate::reader::Reader;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

/// Channel identifier, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chan_{}", self.0)
    }
}

/// How many undelivered items a channel holds before `push` waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capacity {
    /// Never wait
    #[default]
    Unbounded,
    /// Wait while this many items are retained
    Bounded(usize),
}

impl Capacity {
    /// Capacity from an optional bound; `None` and `Some(0)` mean unbounded
    #[must_use]
    pub fn from_bound(bound: Option<usize>) -> Self {
        match bound {
            Some(n) if n > 0 => Self::Bounded(n),
            _ => Self::Unbounded,
        }
    }

    fn has_room(self, retained: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(n) => retained < n,
        }
    }
}

/// Channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Push after end-of-stream
    #[error("channel is closed")]
    Closed,

    /// Bounded push did not find room in time
    #[error("no capacity after waiting {waited_ms}ms")]
    CapacityTimeout {
        /// Time spent waiting
        waited_ms: u64,
    },
}

pub(crate) struct State<T> {
    pub(crate) buffer: VecDeque<T>,
    /// Sequence number of `buffer[0]`
    pub(crate) head: u64,
    pub(crate) closed: bool,
    /// Reader key -> sequence number of the next item it will observe
    pub(crate) readers: IndexMap<u64, u64>,
    next_reader: u64,
    had_readers: bool,
    /// Set once any reader has observed an item
    pub(crate) delivered: bool,
}

impl<T> State<T> {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            head: 0,
            closed: false,
            readers: IndexMap::new(),
            next_reader: 0,
            had_readers: false,
            delivered: false,
        }
    }

    pub(crate) fn tail(&self) -> u64 {
        self.head + self.buffer.len() as u64
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.had_readers && self.readers.is_empty()
    }

    /// Drop every item all readers have passed. Returns the number evicted.
    pub(crate) fn evict(&mut self) -> usize {
        let floor = match self.readers.values().min() {
            Some(&slowest) => slowest,
            None if self.had_readers => self.tail(),
            // Nobody attached yet: keep everything for the first readers.
            None => return 0,
        };
        let mut evicted = 0;
        while self.head < floor && self.buffer.pop_front().is_some() {
            self.head += 1;
            evicted += 1;
        }
        evicted
    }
}

pub(crate) struct Shared<T> {
    id: ChannelId,
    capacity: Capacity,
    state: Mutex<State<T>>,
    /// Signalled on push and close
    pub(crate) item_ready: Notify,
    /// Signalled on eviction, reader detach and close
    pub(crate) space_ready: Notify,
}

impl<T> Shared<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ordered, closable, broadcast conduit of values
///
/// `Channel` is the producer handle. Clones share the same channel.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Channel<T> {
    /// Create an open, empty channel
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: ChannelId::next(),
                capacity,
                state: Mutex::new(State::new()),
                item_ready: Notify::new(),
                space_ready: Notify::new(),
            }),
        }
    }

    /// Create an unbounded channel
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(Capacity::Unbounded)
    }

    /// Create a bounded channel; a bound of zero means unbounded
    #[must_use]
    pub fn bounded(bound: usize) -> Self {
        Self::new(Capacity::from_bound(Some(bound)))
    }

    /// Channel identifier
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.shared.capacity
    }

    /// Attach a new reader.
    ///
    /// Until any reader has observed an item, new readers start at the oldest
    /// retained item, so readers attached up front all see a pre-filled
    /// channel in full. After that they start at the next item to be pushed.
    #[must_use]
    pub fn reader(&self) -> Reader<T> {
        let key = {
            let mut state = self.shared.lock();
            let key = state.next_reader;
            state.next_reader += 1;
            let start = if state.delivered {
                state.tail()
            } else {
                state.head
            };
            state.readers.insert(key, start);
            state.had_readers = true;
            key
        };
        Reader::attach(Arc::clone(&self.shared), key)
    }

    /// Push an item, waiting while a bounded channel is full.
    ///
    /// Items pushed to an abandoned channel are discarded.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if end-of-stream was already pushed
    pub async fn push(&self, item: T) -> Result<(), ChannelError> {
        loop {
            let space = self.shared.space_ready.notified();
            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                if state.is_abandoned() {
                    tracing::trace!(channel = %self.shared.id, "discarding push to abandoned channel");
                    return Ok(());
                }
                if self.shared.capacity.has_room(state.buffer.len()) {
                    state.buffer.push_back(item);
                    drop(state);
                    self.shared.item_ready.notify_waiters();
                    return Ok(());
                }
            }
            space.await;
        }
    }

    /// Push an item, giving up if the bound does not clear within `wait`.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after end-of-stream and `CapacityTimeout` when the wait elapses
    pub async fn push_timeout(&self, item: T, wait: Duration) -> Result<(), ChannelError> {
        match tokio::time::timeout(wait, self.push(item)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::CapacityTimeout {
                waited_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Push without waiting, ignoring the bound
    #[cfg(test)]
    pub(crate) fn push_now(&self, item: T) -> Result<(), ChannelError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if !state.is_abandoned() {
            state.buffer.push_back(item);
        }
        drop(state);
        self.shared.item_ready.notify_waiters();
        Ok(())
    }

    /// Push end-of-stream. Closing twice has no further effect.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        tracing::trace!(channel = %self.shared.id, "channel closed");
        self.shared.item_ready.notify_waiters();
        self.shared.space_ready.notify_waiters();
    }

    /// Whether end-of-stream was pushed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of retained items
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Whether no items are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of attached readers
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.shared.lock().readers.len()
    }

    /// Whether readers attached once and have all detached
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.shared.lock().is_abandoned()
    }
}

impl<T> Channel<T> {
    /// Closed channel pre-filled with `items`
    #[must_use]
    pub fn from_values(items: Vec<T>) -> Self {
        items.into_iter().collect()
    }
}

impl<T> FromIterator<T> for Channel<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let channel = Self::unbounded();
        {
            let mut state = channel.shared.lock();
            state.buffer.extend(iter);
            state.closed = true;
        }
        channel
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("capacity", &self.shared.capacity)
            .field("retained", &state.buffer.len())
            .field("readers", &state.readers.len())
            .field("closed", &state.closed)
            .finish()
    }
}
