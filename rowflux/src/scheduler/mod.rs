//! Execution contexts for blocking scans
//!
//! A [`Scheduler`] accepts a [`ScanTask`] and runs it on a thread that may
//! block. Hard scan failures never reach the stream consumer; they are
//! reported here, through whatever failure channel the scheduler offers.
//!
//! - [`ElasticScheduler`]: tokio's blocking pool, failures logged and passed to an optional hook
//! - [`ScanWorker`]: tracked tasks with status, failure broadcast, concurrency cap and graceful shutdown

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::error::{ClosureReason, ScanError, ScanErrorKind};
use crate::stream::SessionCloser;

mod worker;

pub use worker::{ScanWorker, TaskReport, TaskStatus};

/// Blocking job executed by a scheduler
pub type ScanJob = Box<dyn FnOnce() -> Result<(), ScanError> + Send + 'static>;

/// Callback invoked when a scan fails hard
pub type FailureHook = Arc<dyn Fn(&TaskFailure) + Send + Sync + 'static>;

/// One scheduled scan
pub struct ScanTask {
    id: String,
    statement: String,
    closer: SessionCloser,
    job: ScanJob,
}

impl ScanTask {
    /// Wrap `job` for the session controlled by `closer`
    pub fn new(statement: impl Into<String>, closer: SessionCloser, job: ScanJob) -> Self {
        Self {
            id: format!("scan-{}", uuid::Uuid::now_v7()),
            statement: statement.into(),
            closer,
            job,
        }
    }

    /// Unique task identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Statement being scanned
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Closer of the session this task feeds
    pub fn closer(&self) -> &SessionCloser {
        &self.closer
    }

    /// Run the job on the current thread
    pub fn run(self) -> Result<(), ScanError> {
        (self.job)()
    }
}

impl fmt::Debug for ScanTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanTask")
            .field("id", &self.id)
            .field("statement", &self.statement)
            .field("closed", &self.closer.reason())
            .finish_non_exhaustive()
    }
}

/// A scan that ended with a non-transient failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Task identifier
    pub task_id: String,
    /// Statement that was being scanned
    pub statement: String,
    /// The failure
    pub error: ScanError,
}

/// Something that can run blocking scans
///
/// `schedule` is called from inside the runtime that polls the stream, with
/// a handle to that runtime. Implementations must not run the task on the
/// calling thread.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` on a thread that may block
    fn schedule(&self, task: ScanTask, handle: &Handle);
}

/// Runs scans on tokio's elastic blocking pool
#[derive(Clone, Default)]
pub struct ElasticScheduler {
    on_failure: Option<FailureHook>,
}

impl ElasticScheduler {
    /// Create a scheduler that only logs failures
    pub fn new() -> Self {
        Self::default()
    }

    /// Also pass hard failures to `hook`
    #[must_use]
    pub fn with_failure_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ElasticScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticScheduler")
            .field("has_failure_hook", &self.on_failure.is_some())
            .finish()
    }
}

impl Scheduler for ElasticScheduler {
    fn schedule(&self, task: ScanTask, handle: &Handle) {
        let task_id = task.id().to_string();
        let statement = task.statement().to_string();
        let closer = task.closer().clone();
        let hook = self.on_failure.clone();

        tracing::debug!(task_id = %task_id, statement = %statement, "Scheduling scan");
        let join = handle.spawn_blocking(move || task.run());

        handle.spawn(async move {
            let error = match join.await {
                Ok(Ok(())) => {
                    tracing::debug!(task_id = %task_id, "Scan task finished");
                    return;
                }
                Ok(Err(error)) => error,
                Err(join_error) => {
                    closer.try_close(ClosureReason::SourceFailure);
                    ScanError::new(
                        ScanErrorKind::Other,
                        format!("scan task panicked: {}", join_error),
                    )
                }
            };

            tracing::error!(
                task_id = %task_id,
                statement = %statement,
                error = %error,
                "Scan task failed"
            );
            if let Some(hook) = hook {
                hook(&TaskFailure {
                    task_id,
                    statement,
                    error,
                });
            }
        });
    }
}
