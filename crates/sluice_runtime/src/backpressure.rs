//! Backpressure on graph edges.
//!
//! Every edge channel shares one policy per run: its capacity and how long a
//! producer may wait for room before the push is reported as a failure.

use sluice_channel::{Capacity, Channel, ChannelError};
use std::time::Duration;

/// Outcome of a push under the edge policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item is in the channel
    Delivered,
    /// Every reader detached; the item was dropped
    Abandoned,
}

/// Edge capacity and push deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgePolicy {
    capacity: Capacity,
    push_timeout: Option<Duration>,
}

impl EdgePolicy {
    /// Create a policy
    #[must_use]
    pub fn new(capacity: Capacity, push_timeout: Option<Duration>) -> Self {
        Self {
            capacity,
            push_timeout,
        }
    }

    /// Capacity of every edge channel
    #[must_use]
    pub const fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Longest wait for room, if limited
    #[must_use]
    pub const fn push_timeout(&self) -> Option<Duration> {
        self.push_timeout
    }

    /// Whether producers can be made to wait at all
    #[must_use]
    pub const fn applies(&self) -> bool {
        matches!(self.capacity, Capacity::Bounded(_))
    }

    /// Push `item`, waiting for room according to the policy
    ///
    /// # Errors
    ///
    /// Returns `CapacityTimeout` when the wait elapses and `Closed` after end-of-stream
    pub async fn push<T>(&self, channel: &Channel<T>, item: T) -> Result<PushOutcome, ChannelError> {
        match self.push_timeout {
            Some(wait) => channel.push_timeout(item, wait).await?,
            None => channel.push(item).await?,
        }
        if channel.is_abandoned() {
            Ok(PushOutcome::Abandoned)
        } else {
            Ok(PushOutcome::Delivered)
        }
    }
}
