//! Reader handles.
//!
//! A reader is a cursor over a channel's sequence numbers. Dropping it
//! detaches the cursor and may release retained items.

use crate::channel::Shared;
use std::sync::Arc;

/// Result of a non-waiting read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRecv<T> {
    /// Next item
    Item(T),
    /// Nothing available yet
    Empty,
    /// End-of-stream reached
    Ended,
}

/// Independent cursor over a channel
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
    key: u64,
}

impl<T> Reader<T> {
    pub(crate) fn attach(shared: Arc<Shared<T>>, key: u64) -> Self {
        Self { shared, key }
    }
}

impl<T: Clone> Reader<T> {
    /// Next item, or `None` once end-of-stream is reached
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let shared = Arc::clone(&self.shared);
            let ready = shared.item_ready.notified();
            match self.try_recv() {
                TryRecv::Item(item) => return Some(item),
                TryRecv::Ended => return None,
                TryRecv::Empty => ready.await,
            }
        }
    }

    /// Next item if one is available right now
    pub fn try_recv(&mut self) -> TryRecv<T> {
        let mut state = self.shared.lock();
        let Some(&position) = state.readers.get(&self.key) else {
            return TryRecv::Ended;
        };
        if position < state.tail() {
            let offset = usize::try_from(position - state.head).unwrap_or(usize::MAX);
            let Some(item) = state.buffer.get(offset).cloned() else {
                return TryRecv::Ended;
            };
            state.readers.insert(self.key, position + 1);
            state.delivered = true;
            let evicted = state.evict();
            drop(state);
            if evicted > 0 {
                self.shared.space_ready.notify_waiters();
            }
            TryRecv::Item(item)
        } else if state.closed {
            TryRecv::Ended
        } else {
            TryRecv::Empty
        }
    }

    /// Items this reader has not observed yet
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.shared.lock();
        state
            .readers
            .get(&self.key)
            .map_or(0, |&position| {
                usize::try_from(state.tail().saturating_sub(position)).unwrap_or(usize::MAX)
            })
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.readers.swap_remove(&self.key);
        state.evict();
        drop(state);
        // Wake producers so they notice freed room or abandonment.
        self.shared.space_ready.notify_waiters();
    }
}

impl<T> std::fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").field("key", &self.key).finish_non_exhaustive()
    }
}
