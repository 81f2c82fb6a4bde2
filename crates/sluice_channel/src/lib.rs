//! SLUICE Channels
//!
//! Ordered, closable, broadcast conduits connecting graph nodes. A channel is
//! the only data-transport primitive of the engine: every edge of a bound
//! graph is one channel with one producer and any number of readers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod reader;
pub mod stream;

pub use channel::{Capacity, Channel, ChannelError, ChannelId};
pub use reader::{Reader, TryRecv};
pub use stream::collect;
