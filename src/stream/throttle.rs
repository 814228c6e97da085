//! Stream throttling utilities

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Extension trait to add throttling to any Stream
pub trait ThrottleExt: Stream {
    /// Throttle the stream to emit at most once per interval
    ///
    /// Uses "latest-wins" semantics - if multiple items arrive
    /// during an interval, only the latest is emitted.
    fn throttle(self, duration: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, duration, |_| false)
    }

    /// Like [`throttle`](Self::throttle), but items for which `urgent`
    /// returns true are emitted at once and replace anything pending.
    fn throttle_with(self, duration: Duration, urgent: fn(&Self::Item) -> bool) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, duration, urgent)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    /// A stream combinator that throttles emission rate
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        pending: Option<S::Item>,
        urgent: fn(&S::Item) -> bool,
        done: bool,
    }
}

impl<S: Stream> Throttle<S> {
    /// Create a new throttled stream
    pub fn new(stream: S, duration: Duration, urgent: fn(&S::Item) -> bool) -> Self {
        let mut interval = interval(duration);
        // Don't burst after a quiet period
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, interval, pending: None, urgent, done: false }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain all available items, keeping only the latest
        while !*this.done {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) if (*this.urgent)(&item) => {
                    *this.pending = None;
                    return Poll::Ready(Some(item));
                }
                Poll::Ready(Some(item)) => *this.pending = Some(item),
                Poll::Ready(None) => *this.done = true,
                Poll::Pending => break,
            }
        }

        if this.pending.is_none() {
            return if *this.done { Poll::Ready(None) } else { Poll::Pending };
        }

        ready!(this.interval.poll_tick(cx));
        Poll::Ready(this.pending.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn is_final(value: &u32) -> bool {
        *value >= 100
    }

    #[tokio::test(start_paused = true)]
    async fn latest_wins_within_an_interval() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = UnboundedReceiverStream::new(rx).throttle(Duration::from_secs(1));

        tx.send(1).unwrap();
        assert_eq!(stream.next().await, Some(1));

        let start = Instant::now();
        for value in 2..=5 {
            tx.send(value).unwrap();
        }
        assert_eq!(stream.next().await, Some(5));
        assert!(start.elapsed() >= Duration::from_secs(1));

        drop(tx);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_items_skip_the_interval() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream =
            UnboundedReceiverStream::new(rx).throttle_with(Duration::from_secs(1), is_final);

        tx.send(1).unwrap();
        assert_eq!(stream.next().await, Some(1));

        let start = Instant::now();
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        tx.send(100).unwrap();
        assert_eq!(stream.next().await, Some(100));
        assert_eq!(start.elapsed(), Duration::ZERO);

        // superseded items are not replayed
        drop(tx);
        assert_eq!(stream.next().await, None);
    }
}
