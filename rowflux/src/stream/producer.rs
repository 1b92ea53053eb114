//! Blocking side of the bridge
//!
//! A [`RowProducer`] runs one scan to completion on the thread that calls
//! [`RowProducer::run`], mapping each row and pushing it through the session.
//! All failure classification happens here; the consumer only ever sees
//! items, an end marker, or a closed session.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use super::item::Item;
use super::session::{SendOutcome, SessionProducer};
use crate::error::{ClosureReason, ScanError};
use crate::source::{Bindings, RowSource};

/// Runs one scan and feeds the session
pub struct RowProducer<S, F, R>
where
    S: RowSource,
{
    session: SessionProducer<R>,
    source: Arc<S>,
    statement: String,
    bindings: Bindings,
    mapper: F,
    buffer_timeout: Duration,
}

impl<S, F, R> RowProducer<S, F, R>
where
    S: RowSource,
    F: Fn(&S::Row, usize) -> R,
{
    /// Create a producer for one invocation
    pub fn new(
        session: SessionProducer<R>,
        source: Arc<S>,
        statement: impl Into<String>,
        bindings: Bindings,
        mapper: F,
        buffer_timeout: Duration,
    ) -> Self {
        Self {
            session,
            source,
            statement: statement.into(),
            bindings,
            mapper,
            buffer_timeout,
        }
    }

    /// Execute the scan, blocking the current thread
    ///
    /// Returns `Err` only for non-transient scan failures; the session is
    /// closed with [`ClosureReason::SourceFailure`] before returning it.
    pub fn run(self) -> Result<(), ScanError> {
        let Self {
            session,
            source,
            statement,
            bindings,
            mapper,
            buffer_timeout,
        } = self;

        if session.is_closed() {
            tracing::debug!(
                statement = %statement,
                reason = ?session.closer().reason(),
                "Stream closed before scan started, skipping"
            );
            return Ok(());
        }

        let mut rows_sent: usize = 0;
        let scanned = source.execute_scan(&statement, &bindings, &mut |row, index| {
            if session.is_closed() {
                return ControlFlow::Break(());
            }

            let item = Item::Value(mapper(row, index));
            match session.try_send(item, buffer_timeout) {
                SendOutcome::Sent => {
                    rows_sent += 1;
                    ControlFlow::Continue(())
                }
                SendOutcome::TimedOut => {
                    tracing::warn!(
                        statement = %statement,
                        rows_sent,
                        timeout_ms = buffer_timeout.as_millis() as u64,
                        "Timed out waiting for queue space, closing stream"
                    );
                    ControlFlow::Break(())
                }
                SendOutcome::Disconnected => {
                    tracing::debug!(statement = %statement, rows_sent, "Stream consumer went away");
                    ControlFlow::Break(())
                }
                SendOutcome::Closed => {
                    tracing::debug!(
                        statement = %statement,
                        rows_sent,
                        reason = ?session.closer().reason(),
                        "Stream closed, abandoning scan"
                    );
                    ControlFlow::Break(())
                }
            }
        });

        match scanned {
            Ok(()) => {
                if !session.is_closed() {
                    match session.try_send(Item::End, buffer_timeout) {
                        SendOutcome::Sent => {
                            tracing::debug!(statement = %statement, rows_sent, "Scan complete");
                        }
                        outcome => {
                            tracing::warn!(
                                statement = %statement,
                                rows_sent,
                                ?outcome,
                                "Could not deliver end of stream"
                            );
                        }
                    }
                }
                Ok(())
            }
            Err(err) if session.is_closed() => {
                // The source noticed the stop request; nothing left to report.
                tracing::debug!(
                    statement = %statement,
                    error = %err,
                    reason = ?session.closer().reason(),
                    "Scan stopped after stream closed"
                );
                Ok(())
            }
            Err(err) if err.is_transient() => {
                session.try_close(ClosureReason::TransientSourceFailure);
                tracing::warn!(
                    statement = %statement,
                    rows_sent,
                    kind = %err.kind,
                    error = %err,
                    "Row source went away, closing stream"
                );
                Ok(())
            }
            Err(err) => {
                session.try_close(ClosureReason::SourceFailure);
                tracing::error!(
                    statement = %statement,
                    rows_sent,
                    kind = %err.kind,
                    error = %err,
                    "Failed to stream rows"
                );
                Err(err.with_statement(statement))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryRowSource;
    use crate::stream::session::Session;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSource {
        rows: Vec<u32>,
        error: ScanError,
    }

    impl RowSource for FailingSource {
        type Row = u32;

        fn execute_scan(
            &self,
            _statement: &str,
            _bindings: &Bindings,
            on_row: &mut dyn FnMut(&u32, usize) -> ControlFlow<()>,
        ) -> Result<(), ScanError> {
            for (index, row) in self.rows.iter().enumerate() {
                if on_row(row, index).is_break() {
                    return Ok(());
                }
            }
            Err(self.error.clone())
        }
    }

    async fn drain<R: Send + 'static>(
        consumer: &mut crate::stream::session::SessionConsumer<R>,
    ) -> Vec<Item<R>> {
        let mut items = Vec::new();
        while let Some(item) = consumer.receive().await {
            items.push(item);
        }
        items
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exhausted_scan_sends_single_end() {
        let (session, mut consumer) = Session::open::<u32>(8);
        let producer = RowProducer::new(
            session,
            Arc::new(MemoryRowSource::new(vec![1_u32, 2, 3])),
            "SELECT n",
            Bindings::new(),
            |row: &u32, _| row * 10,
            Duration::from_secs(1),
        );

        tokio::task::spawn_blocking(move || producer.run())
            .await
            .unwrap()
            .unwrap();

        let items = drain(&mut consumer).await;
        assert_eq!(
            items,
            vec![
                Item::Value(10),
                Item::Value(20),
                Item::Value(30),
                Item::End
            ]
        );
        assert!(!consumer.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_failure_is_swallowed() {
        let (session, mut consumer) = Session::open::<u32>(8);
        let source = FailingSource {
            rows: vec![1, 2],
            error: ScanError::connection_closed("connection reset"),
        };
        let producer = RowProducer::new(
            session,
            Arc::new(source),
            "SELECT n",
            Bindings::new(),
            |row: &u32, _| *row,
            Duration::from_secs(1),
        );

        let result = tokio::task::spawn_blocking(move || producer.run())
            .await
            .unwrap();
        assert!(result.is_ok());

        let items = drain(&mut consumer).await;
        assert_eq!(items, vec![Item::Value(1), Item::Value(2)]);
        assert_eq!(
            consumer.reason(),
            Some(ClosureReason::TransientSourceFailure)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hard_failure_is_returned() {
        let (session, consumer) = Session::open::<u32>(8);
        let source = FailingSource {
            rows: vec![1],
            error: ScanError::query_failed("division by zero"),
        };
        let producer = RowProducer::new(
            session,
            Arc::new(source),
            "SELECT 1 / 0",
            Bindings::new(),
            |row: &u32, _| *row,
            Duration::from_secs(1),
        );

        let err = tokio::task::spawn_blocking(move || producer.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.statement.as_deref(), Some("SELECT 1 / 0"));
        assert_eq!(consumer.reason(), Some(ClosureReason::SourceFailure));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stalled_consumer_closes_without_end() {
        let (session, mut consumer) = Session::open::<u32>(1);
        let producer = RowProducer::new(
            session,
            Arc::new(MemoryRowSource::new(vec![1_u32, 2, 3])),
            "SELECT n",
            Bindings::new(),
            |row: &u32, _| *row,
            Duration::from_millis(10),
        );

        tokio::task::spawn_blocking(move || producer.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(consumer.reason(), Some(ClosureReason::ConsumerTimeout));
        let items = drain(&mut consumer).await;
        assert_eq!(items, vec![Item::Value(1)]);
    }

    /// Counts `execute_scan` calls
    struct CountingSource {
        scans: AtomicUsize,
        rows: Vec<u32>,
    }

    impl RowSource for CountingSource {
        type Row = u32;

        fn execute_scan(
            &self,
            _statement: &str,
            _bindings: &Bindings,
            on_row: &mut dyn FnMut(&u32, usize) -> ControlFlow<()>,
        ) -> Result<(), ScanError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            for (index, row) in self.rows.iter().enumerate() {
                if on_row(row, index).is_break() {
                    break;
                }
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_session_skips_scan() {
        let (session, consumer) = Session::open::<u32>(4);
        consumer.try_close(ClosureReason::Cancelled);

        let source = Arc::new(CountingSource {
            scans: AtomicUsize::new(0),
            rows: vec![1, 2, 3],
        });
        let mapped = Arc::new(AtomicUsize::new(0));
        let counter = mapped.clone();
        let producer = RowProducer::new(
            session,
            source.clone(),
            "SELECT n",
            Bindings::new(),
            move |row: &u32, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                *row
            },
            Duration::from_secs(1),
        );

        tokio::task::spawn_blocking(move || producer.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapped.load(Ordering::SeqCst), 0);
        assert_eq!(source.scans.load(Ordering::SeqCst), 0);
    }
}
