//! Bridges between channels and `futures` streams.

use crate::channel::{Capacity, Channel};
use crate::reader::Reader;
use futures::stream::{self, Stream, StreamExt};

impl<T> Channel<T>
where
    T: Send + 'static,
{
    /// Channel fed by `source` on a spawned task. It closes when the stream ends.
    ///
    /// Must be called from within a tokio runtime. The pump stops early if
    /// every reader detaches.
    pub fn from_stream<S>(source: S, capacity: Capacity) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let channel = Self::new(capacity);
        let producer = channel.clone();
        tokio::spawn(async move {
            let mut source = std::pin::pin!(source);
            while let Some(item) = source.next().await {
                if producer.push(item).await.is_err() || producer.is_abandoned() {
                    break;
                }
            }
            producer.close();
        });
        channel
    }
}

impl<T> Reader<T>
where
    T: Clone + Send + 'static,
{
    /// Adapt this reader into a stream that ends at end-of-stream
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(self, |mut reader| async move {
            reader.recv().await.map(|item| (item, reader))
        })
    }
}

/// Drain a reader into a vector
pub async fn collect<T: Clone>(mut reader: Reader<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = reader.recv().await {
        items.push(item);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::TryRecv;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_from_stream_closes_at_end() {
        let channel = Channel::from_stream(stream::iter(vec![1, 2, 3]), Capacity::Bounded(1));
        let reader = channel.reader();
        assert_eq!(collect(reader).await, vec![1, 2, 3]);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let channel = Channel::from_values(vec!["x", "y"]);
        let items: Vec<_> = channel.reader().into_stream().collect().await;
        assert_eq!(items, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_from_stream_stops_when_abandoned() {
        let channel = Channel::from_stream(stream::iter(0..), Capacity::Bounded(2));
        let mut reader = channel.reader();
        assert_eq!(reader.recv().await, Some(0));
        drop(reader);

        // The pump notices abandonment and closes instead of spinning forever.
        for _ in 0..100 {
            if channel.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(channel.is_closed());
    }

    proptest! {
        #[test]
        fn prop_every_reader_sees_emission_order(items in proptest::collection::vec(any::<i64>(), 0..64)) {
            let channel = Channel::from_values(items.clone());
            let mut a = channel.reader();
            let mut b = channel.reader();

            let mut seen_a = Vec::new();
            let mut seen_b = Vec::new();
            // Interleave the readers at different paces.
            loop {
                let step_a = a.try_recv();
                if let TryRecv::Item(item) = step_a.clone() {
                    seen_a.push(item);
                }
                let step_b = if seen_a.len() % 2 == 0 { b.try_recv() } else { TryRecv::Empty };
                if let TryRecv::Item(item) = step_b {
                    seen_b.push(item);
                }
                if step_a == TryRecv::Ended {
                    break;
                }
            }
            while let TryRecv::Item(item) = b.try_recv() {
                seen_b.push(item);
            }

            prop_assert_eq!(&seen_a, &items);
            prop_assert_eq!(&seen_b, &items);
            prop_assert_eq!(channel.len(), 0);
        }
    }
}
