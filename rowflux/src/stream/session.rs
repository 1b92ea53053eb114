//! Shared state of one streaming invocation
//!
//! A session pairs the bounded transfer queue with the closed state. It is
//! opened once per invocation and split into a [`SessionProducer`] (owned by
//! the blocking scan) and a [`SessionConsumer`] (owned by the stream).
//!
//! The closed state is a once-set [`ClosureReason`] plus a
//! [`CancellationToken`] used purely as a wake-up: the reason is recorded
//! before the token fires, so anyone woken by the token observes it.

use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::item::Item;
use crate::error::ClosureReason;

#[derive(Debug, Default)]
struct ClosedState {
    reason: OnceLock<ClosureReason>,
    token: CancellationToken,
}

/// Handle that can close a session from anywhere
///
/// Cloning is cheap; all clones observe and affect the same session.
#[derive(Debug, Clone, Default)]
pub struct SessionCloser {
    state: Arc<ClosedState>,
}

impl SessionCloser {
    /// Close the session with `reason`
    ///
    /// Returns `true` if this call closed it, `false` if it was already closed.
    /// The first recorded reason is never replaced.
    pub fn try_close(&self, reason: ClosureReason) -> bool {
        if self.state.reason.set(reason).is_ok() {
            self.state.token.cancel();
            true
        } else {
            false
        }
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.state.reason.get().is_some()
    }

    /// Why the session was closed, if it was
    pub fn reason(&self) -> Option<ClosureReason> {
        self.state.reason.get().copied()
    }

    /// Future that resolves once the session is closed
    pub(crate) fn closed(&self) -> WaitForCancellationFutureOwned {
        self.state.token.clone().cancelled_owned()
    }

    fn token(&self) -> &CancellationToken {
        &self.state.token
    }
}

/// Outcome of [`SessionProducer::try_send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The item was enqueued
    Sent,
    /// The queue stayed full for the whole timeout; the session is now closed
    TimedOut,
    /// The consumer side is gone; the session is now closed
    Disconnected,
    /// The session was already closed, or closed while waiting
    Closed,
}

/// Entry point for opening sessions
pub struct Session;

impl Session {
    /// Open a session with a transfer queue of `capacity` items
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn open<R>(capacity: usize) -> (SessionProducer<R>, SessionConsumer<R>) {
        let (tx, rx) = mpsc::channel(capacity);
        let closer = SessionCloser::default();

        (
            SessionProducer {
                closer: closer.clone(),
                tx,
                handle: None,
            },
            SessionConsumer { closer, rx },
        )
    }
}

/// Producer half of a session
///
/// All methods block and must be called from a thread that is not driving
/// an async runtime (for example a `spawn_blocking` worker).
#[derive(Debug)]
pub struct SessionProducer<R> {
    closer: SessionCloser,
    tx: mpsc::Sender<Item<R>>,
    handle: Option<Handle>,
}

impl<R> SessionProducer<R> {
    /// Pin the runtime used to wait on the queue
    ///
    /// Without a pinned handle the producer uses the runtime of the calling
    /// thread.
    #[must_use]
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Close the session with `reason`
    pub fn try_close(&self, reason: ClosureReason) -> bool {
        self.closer.try_close(reason)
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Closer for this session
    pub fn closer(&self) -> &SessionCloser {
        &self.closer
    }

    /// Enqueue `item`, waiting at most `timeout` for queue space
    ///
    /// A timeout closes the session with [`ClosureReason::ConsumerTimeout`];
    /// a vanished consumer closes it with [`ClosureReason::Cancelled`]. A
    /// closure that happens while waiting ends the wait immediately.
    pub fn try_send(&self, item: Item<R>, timeout: Duration) -> SendOutcome {
        if self.closer.is_closed() {
            return SendOutcome::Closed;
        }

        let Some(handle) = self.handle.clone().or_else(|| Handle::try_current().ok()) else {
            tracing::error!("No tokio runtime available to the stream producer");
            self.closer.try_close(ClosureReason::SourceFailure);
            return SendOutcome::Closed;
        };

        let token = self.closer.token().clone();
        let tx = &self.tx;
        let outcome = handle.block_on(async move {
            tokio::select! {
                biased;

                () = token.cancelled() => SendOutcome::Closed,
                sent = tokio::time::timeout(timeout, tx.send(item)) => match sent {
                    Ok(Ok(())) => SendOutcome::Sent,
                    Ok(Err(_)) => SendOutcome::Disconnected,
                    Err(_) => SendOutcome::TimedOut,
                },
            }
        });

        match outcome {
            SendOutcome::TimedOut => {
                self.closer.try_close(ClosureReason::ConsumerTimeout);
            }
            SendOutcome::Disconnected => {
                self.closer.try_close(ClosureReason::Cancelled);
            }
            SendOutcome::Sent | SendOutcome::Closed => {}
        }
        outcome
    }
}

/// Consumer half of a session
#[derive(Debug)]
pub struct SessionConsumer<R> {
    closer: SessionCloser,
    rx: mpsc::Receiver<Item<R>>,
}

impl<R> SessionConsumer<R> {
    /// Close the session with `reason`
    pub fn try_close(&self, reason: ClosureReason) -> bool {
        self.closer.try_close(reason)
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Why the session was closed, if it was
    pub fn reason(&self) -> Option<ClosureReason> {
        self.closer.reason()
    }

    /// Closer for this session
    pub fn closer(&self) -> &SessionCloser {
        &self.closer
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the producer half is gone and the queue is drained.
    pub async fn receive(&mut self) -> Option<Item<R>> {
        self.rx.recv().await
    }

    /// Poll for the next item
    pub fn poll_receive(&mut self, cx: &mut Context<'_>) -> Poll<Option<Item<R>>> {
        self.rx.poll_recv(cx)
    }

    /// Cancel the session and refuse further items
    pub fn cancel(&mut self) {
        self.closer.try_close(ClosureReason::Cancelled);
        self.rx.close();
    }
}

impl<R> Drop for SessionConsumer<R> {
    fn drop(&mut self) {
        self.closer.try_close(ClosureReason::Cancelled);
    }
}
