//! Pull side of the bridge
//!
//! [`RowStream`] is a lazy, single-pass [`Stream`] over the rows of one
//! invocation. Nothing is scheduled until the first poll; every poll checks
//! the closed state before touching the queue.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream};
use tokio::runtime::Handle;
use tokio_util::sync::WaitForCancellationFutureOwned;

use super::item::Item;
use super::session::{SessionCloser, SessionConsumer};
use crate::error::{ClosureReason, Error, Result};

/// Deferred start of the producer, run on first poll with the polling runtime
pub(crate) type StartScan = Box<dyn FnOnce(Handle) + Send + 'static>;

/// Cancels a [`RowStream`] from outside the task that polls it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    closer: SessionCloser,
}

impl CancelHandle {
    /// Cancel the stream
    ///
    /// The consumer observes `Error::Closed(ClosureReason::Cancelled)` on its
    /// next poll, or immediately if it is waiting for a row.
    pub fn cancel(&self) {
        if self.closer.try_close(ClosureReason::Cancelled) {
            tracing::debug!("Row stream cancelled");
        }
    }

    /// Whether the stream has been closed for any reason
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

/// Lazy stream of mapped rows from one scan
///
/// Yields `Ok(row)` per row in source order and ends with `None` after the
/// last row. If the invocation is closed early the stream yields a single
/// `Err(Error::Closed(reason))` and then ends.
///
/// A `RowStream` has exactly one consumer: it is neither `Clone` nor usable
/// through a shared reference. Dropping it cancels the scan.
pub struct RowStream<R> {
    consumer: SessionConsumer<R>,
    start: Option<StartScan>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl<R> RowStream<R> {
    pub(crate) fn new(consumer: SessionConsumer<R>, start: StartScan) -> Self {
        let closed = Box::pin(consumer.closer().closed());
        Self {
            consumer,
            start: Some(start),
            closed,
            done: false,
        }
    }

    /// Handle for cancelling this stream from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            closer: self.consumer.closer().clone(),
        }
    }

    /// Cancel the stream; no further items are yielded
    pub fn cancel(&mut self) {
        self.consumer.cancel();
        self.start = None;
        self.done = true;
    }

    /// Whether the scan has been scheduled yet
    pub fn is_started(&self) -> bool {
        self.start.is_none()
    }

    /// Whether the invocation has been closed early
    pub fn is_closed(&self) -> bool {
        self.consumer.is_closed()
    }

    fn finish(&mut self, reason: ClosureReason) -> Poll<Option<Result<R>>> {
        self.done = true;
        Poll::Ready(Some(Err(Error::Closed(reason))))
    }
}

impl<R> Stream for RowStream<R> {
    type Item = Result<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if this.done {
            return Poll::Ready(None);
        }

        if let Some(start) = this.start.take() {
            if let Some(reason) = this.consumer.reason() {
                // Closed before the first poll; the scan is never scheduled
                drop(start);
                return this.finish(reason);
            }
            match Handle::try_current() {
                Ok(handle) => start(handle),
                Err(_) => {
                    this.done = true;
                    this.consumer.try_close(ClosureReason::SourceFailure);
                    return Poll::Ready(Some(Err(Error::Internal(
                        "RowStream must be polled from within a tokio runtime".to_string(),
                    ))));
                }
            }
        }

        if let Some(reason) = this.consumer.reason() {
            return this.finish(reason);
        }

        match this.consumer.poll_receive(cx) {
            Poll::Ready(Some(Item::Value(row))) => Poll::Ready(Some(Ok(row))),
            Poll::Ready(Some(Item::End)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                // Producer is gone without an end marker
                let reason = this
                    .consumer
                    .reason()
                    .unwrap_or(ClosureReason::SourceFailure);
                this.finish(reason)
            }
            Poll::Pending => {
                if this.closed.poll_unpin(cx).is_ready() {
                    let reason = this
                        .consumer
                        .reason()
                        .unwrap_or(ClosureReason::Cancelled);
                    return this.finish(reason);
                }
                Poll::Pending
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, None)
        }
    }
}

impl<R> fmt::Debug for RowStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("started", &self.is_started())
            .field("closed", &self.consumer.reason())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::session::Session;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn stream_of(values: Vec<u32>, capacity: usize) -> (RowStream<u32>, Arc<AtomicBool>) {
        let (producer, consumer) = Session::open::<u32>(capacity);
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let start: StartScan = Box::new(move |handle| {
            flag.store(true, Ordering::SeqCst);
            let producer = producer.with_handle(handle.clone());
            handle.spawn_blocking(move || {
                for value in values {
                    producer.try_send(Item::Value(value), Duration::from_secs(1));
                }
                producer.try_send(Item::End, Duration::from_secs(1));
            });
        });
        (RowStream::new(consumer, start), started)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cold_start() {
        let (stream, started) = stream_of(vec![1, 2], 4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!started.load(Ordering::SeqCst));
        assert!(!stream.is_started());

        let rows: Vec<u32> = stream.map(|row| row.unwrap()).collect().await;
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(rows, vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_terminal_signal_is_final() {
        let (mut stream, _) = stream_of(vec![7], 4);
        assert_eq!(stream.next().await.unwrap().unwrap(), 7);
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        assert_eq!(stream.size_hint(), (0, Some(0)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_handle_wakes_waiting_consumer() {
        let (producer, consumer) = Session::open::<u32>(4);
        let parked = Arc::new(std::sync::Mutex::new(None));
        let slot = parked.clone();
        let start: StartScan = Box::new(move |_handle| {
            // Keep the producer alive without ever sending
            *slot.lock().unwrap() = Some(producer);
        });
        let mut stream = RowStream::new(consumer, start);
        let cancel = stream.cancel_handle();

        let waiter = tokio::spawn(async move { stream.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let item = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        let err = item.unwrap().unwrap_err();
        assert_eq!(err.closure_reason(), Some(ClosureReason::Cancelled));
        assert!(cancel.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_cancel_ends_quietly() {
        let (mut stream, _) = stream_of(vec![1, 2, 3], 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        stream.cancel();
        assert!(stream.next().await.is_none());
        assert!(stream.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_producer_vanishing_reports_source_failure() {
        let (producer, consumer) = Session::open::<u32>(4);
        let start: StartScan = Box::new(move |_handle| drop(producer));
        let mut stream = RowStream::new(consumer, start);

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.closure_reason(), Some(ClosureReason::SourceFailure));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_before_first_poll_never_starts() {
        let (producer, consumer) = Session::open::<u32>(4);
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let start: StartScan = Box::new(move |_handle| {
            flag.store(true, Ordering::SeqCst);
            drop(producer);
        });
        let mut stream = RowStream::new(consumer, start);
        stream.cancel_handle().cancel();

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.closure_reason(), Some(ClosureReason::Cancelled));
        assert!(stream.next().await.is_none());
        assert!(!started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_poll_outside_runtime_fails() {
        let (producer, consumer) = Session::open::<u32>(4);
        let start: StartScan = Box::new(move |_handle| drop(producer));
        let mut stream = RowStream::new(consumer, start);

        let first = futures::executor::block_on(stream.next());
        assert!(matches!(first, Some(Err(Error::Internal(_)))));
        assert!(futures::executor::block_on(stream.next()).is_none());
    }
}
