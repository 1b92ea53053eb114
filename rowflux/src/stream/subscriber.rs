//! Push-style consumption of a [`RowStream`]
//!
//! Most callers iterate the stream directly with `StreamExt`. A
//! [`Subscriber`] suits callers that would rather react to signals: one
//! `on_next` per row, then exactly one of `on_complete` or `on_error`.

use futures::StreamExt;

use super::generator::RowStream;
use crate::error::Error;

/// Demand returned from [`Subscriber::on_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    /// Keep delivering rows
    More,
    /// Stop; the scan is cancelled and no terminal signal follows
    Cancel,
}

/// Receiver of row stream signals
pub trait Subscriber<R>: Send {
    /// Called once per row, in source order
    fn on_next(&mut self, row: R) -> Demand;

    /// Called once after the last row
    fn on_complete(&mut self) {}

    /// Called once if the stream was closed early
    fn on_error(&mut self, error: Error) {
        tracing::debug!(error = %error, "Row stream ended with error");
    }
}

impl<R: Send + 'static> RowStream<R> {
    /// Drive the stream to its end, pushing every signal into `subscriber`
    ///
    /// Returns the number of rows delivered.
    pub async fn subscribe<S>(mut self, subscriber: &mut S) -> usize
    where
        S: Subscriber<R> + ?Sized,
    {
        let mut delivered = 0;
        while let Some(item) = self.next().await {
            match item {
                Ok(row) => {
                    delivered += 1;
                    if subscriber.on_next(row) == Demand::Cancel {
                        tracing::debug!(delivered, "Subscriber cancelled row stream");
                        self.cancel();
                        return delivered;
                    }
                }
                Err(error) => {
                    subscriber.on_error(error);
                    return delivered;
                }
            }
        }
        subscriber.on_complete();
        delivered
    }
}
