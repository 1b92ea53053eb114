//! Entry point of the bridge
//!
//! [`StreamTemplate`] turns a blocking [`RowSource`] scan into a lazy
//! [`RowStream`]. Each call opens a fresh session; the scan is handed to the
//! template's [`Scheduler`] only when the stream is first polled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use super::generator::{RowStream, StartScan};
use super::producer::RowProducer;
use super::session::Session;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::scheduler::{ElasticScheduler, ScanTask, Scheduler};
use crate::source::{Bindings, RowSource};

/// Default transfer queue capacity
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Default time the producer waits for queue space
pub const DEFAULT_BUFFER_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Per-call overrides for [`StreamTemplate::stream_with`]
///
/// Unset fields fall back to the template's defaults.
#[derive(Clone, Default)]
pub struct StreamOptions {
    scheduler: Option<Arc<dyn Scheduler>>,
    queue_size: Option<usize>,
    buffer_timeout: Option<Duration>,
}

impl StreamOptions {
    /// Options that change nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the scan on `scheduler`
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Use a transfer queue of `size` rows
    #[must_use]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Wait at most `timeout` for queue space before giving up on the consumer
    #[must_use]
    pub fn buffer_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("custom_scheduler", &self.scheduler.is_some())
            .field("queue_size", &self.queue_size)
            .field("buffer_timeout", &self.buffer_timeout)
            .finish()
    }
}

/// Builds row streams over blocking scans
///
/// Cloning is cheap and shares the scheduler.
#[derive(Clone)]
pub struct StreamTemplate {
    scheduler: Arc<dyn Scheduler>,
    queue_size: usize,
    buffer_timeout: Duration,
}

impl Default for StreamTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTemplate {
    /// Template using the blocking pool, a queue of 100 rows and a 10 second buffer timeout
    pub fn new() -> Self {
        Self {
            scheduler: Arc::new(ElasticScheduler::new()),
            queue_size: DEFAULT_QUEUE_SIZE,
            buffer_timeout: DEFAULT_BUFFER_TIMEOUT,
        }
    }

    /// Template with explicit defaults
    pub fn with_defaults(
        scheduler: Arc<dyn Scheduler>,
        queue_size: usize,
        buffer_timeout: Duration,
    ) -> Result<Self> {
        validate(queue_size, buffer_timeout)?;
        Ok(Self {
            scheduler,
            queue_size,
            buffer_timeout,
        })
    }

    /// Template configured from the `stream` section
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        Self::with_defaults(
            Arc::new(ElasticScheduler::new()),
            config.queue_size,
            config.buffer_timeout(),
        )
    }

    /// Replace the default scheduler
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Default transfer queue capacity
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Default buffer timeout
    pub fn buffer_timeout(&self) -> Duration {
        self.buffer_timeout
    }

    /// Stream the rows of `statement`, mapped through `mapper`
    ///
    /// The returned stream is cold: the scan starts on the first poll. Each
    /// call is an independent invocation with its own queue.
    pub fn stream<S, F, R>(
        &self,
        source: Arc<S>,
        statement: impl Into<String>,
        bindings: Bindings,
        mapper: F,
    ) -> RowStream<R>
    where
        S: RowSource,
        F: Fn(&S::Row, usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.open(
            self.scheduler.clone(),
            self.queue_size,
            self.buffer_timeout,
            source,
            statement.into(),
            bindings,
            mapper,
        )
    }

    /// Like [`stream`](Self::stream) with per-call overrides
    ///
    /// Fails with [`Error::Validation`] for a zero queue size or timeout.
    pub fn stream_with<S, F, R>(
        &self,
        source: Arc<S>,
        statement: impl Into<String>,
        bindings: Bindings,
        mapper: F,
        options: StreamOptions,
    ) -> Result<RowStream<R>>
    where
        S: RowSource,
        F: Fn(&S::Row, usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        let queue_size = options.queue_size.unwrap_or(self.queue_size);
        let buffer_timeout = options.buffer_timeout.unwrap_or(self.buffer_timeout);
        validate(queue_size, buffer_timeout)?;

        let scheduler = options
            .scheduler
            .unwrap_or_else(|| self.scheduler.clone());
        Ok(self.open(
            scheduler,
            queue_size,
            buffer_timeout,
            source,
            statement.into(),
            bindings,
            mapper,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn open<S, F, R>(
        &self,
        scheduler: Arc<dyn Scheduler>,
        queue_size: usize,
        buffer_timeout: Duration,
        source: Arc<S>,
        statement: String,
        bindings: Bindings,
        mapper: F,
    ) -> RowStream<R>
    where
        S: RowSource,
        F: Fn(&S::Row, usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (producer, consumer) = Session::open::<R>(queue_size);

        let start: StartScan = Box::new(move |handle: Handle| {
            let closer = producer.closer().clone();
            let producer = RowProducer::new(
                producer.with_handle(handle.clone()),
                source,
                statement.clone(),
                bindings,
                mapper,
                buffer_timeout,
            );
            let task = ScanTask::new(statement, closer, Box::new(move || producer.run()));
            tracing::debug!(
                task_id = %task.id(),
                statement = %task.statement(),
                queue_size,
                "Starting row stream"
            );
            scheduler.schedule(task, &handle);
        });

        RowStream::new(consumer, start)
    }
}

impl fmt::Debug for StreamTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTemplate")
            .field("queue_size", &self.queue_size)
            .field("buffer_timeout", &self.buffer_timeout)
            .finish_non_exhaustive()
    }
}

fn validate(queue_size: usize, buffer_timeout: Duration) -> Result<()> {
    if queue_size == 0 {
        return Err(Error::Validation(
            "queue size must be greater than 0".to_string(),
        ));
    }
    if buffer_timeout.is_zero() {
        return Err(Error::Validation(
            "buffer timeout must be greater than 0".to_string(),
        ));
    }
    Ok(())
}
