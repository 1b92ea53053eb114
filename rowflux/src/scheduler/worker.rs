//! Managed execution context for scans
//!
//! `ScanWorker` is a managed alternative to handing scans straight to the
//! blocking pool. It offers:
//!
//! - **Task tracking**: every scan gets an ID and a [`TaskStatus`]
//! - **Failure channel**: hard failures are broadcast to [`ScanWorker::failures`] listeners
//! - **Concurrency cap**: optional limit on scans running at once
//! - **Cancellation**: individual scans can be cancelled by ID
//! - **Graceful shutdown**: all scans are cancelled and awaited
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rowflux::prelude::*;
//!
//! let worker = ScanWorker::new().with_max_concurrency(8);
//! let mut failures = worker.failures();
//! let template = StreamTemplate::new().with_scheduler(Arc::new(worker.clone()));
//!
//! tokio::spawn(async move {
//!     while let Ok(failure) = failures.recv().await {
//!         tracing::error!(task_id = %failure.task_id, "scan failed: {}", failure.error);
//!     }
//! });
//!
//! // ... stream rows through `template` ...
//!
//! worker.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ScanTask, Scheduler, TaskFailure};
use crate::config::StreamConfig;
use crate::error::{ClosureReason, ScanError, ScanErrorKind};
use crate::stream::SessionCloser;

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Status of a scan task
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is queued but not yet started
    #[default]
    Pending,
    /// Task is currently scanning
    Running,
    /// Scan ran to the end of its rows
    Completed,
    /// Scan stopped early because the stream closed (timeout, transient failure)
    Closed(ClosureReason),
    /// Scan failed with a non-transient error
    Failed(String),
    /// Task was cancelled
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has stopped running
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Point-in-time view of a tracked task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    /// Task identifier
    pub task_id: String,
    /// Statement being scanned
    pub statement: String,
    /// When the task was handed to the worker
    pub submitted_at: DateTime<Utc>,
    /// Current status
    pub status: TaskStatus,
}

/// Internal tracking information for a task
#[derive(Debug)]
struct TaskInfo {
    task_id: String,
    statement: String,
    submitted_at: DateTime<Utc>,
    join_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    closer: SessionCloser,
    status: Arc<Mutex<TaskStatus>>,
}

#[derive(Debug)]
struct WorkerInner {
    tasks: DashMap<String, TaskInfo>,
    root_token: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
    failures: broadcast::Sender<TaskFailure>,
    shutdown_timeout: Duration,
    auto_cleanup: bool,
}

/// Tracked execution context for scans
///
/// Cloning shares the same task map. Finished tasks stay tracked so their
/// status can be read; a long-lived worker should either call
/// [`cleanup_finished_tasks`](Self::cleanup_finished_tasks) periodically or
/// be built [`with_auto_cleanup`](Self::with_auto_cleanup).
#[derive(Clone, Debug)]
pub struct ScanWorker {
    inner: Arc<WorkerInner>,
}

impl Default for ScanWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanWorker {
    /// Create a worker with no concurrency limit
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(WorkerInner {
                tasks: DashMap::new(),
                root_token: CancellationToken::new(),
                limiter: None,
                failures,
                shutdown_timeout: Duration::from_secs(5),
                auto_cleanup: false,
            }),
        }
    }

    /// Create a worker from stream configuration
    pub fn from_config(config: &StreamConfig) -> Self {
        let worker = Self::new().with_shutdown_timeout(config.shutdown_timeout());
        match config.max_concurrent_scans {
            Some(limit) => worker.with_max_concurrency(limit),
            None => worker,
        }
    }

    /// Allow at most `limit` scans to run at once; the rest wait as `Pending`
    ///
    /// Must be called before the worker is cloned or used.
    #[must_use]
    pub fn with_max_concurrency(self, limit: usize) -> Self {
        self.rebuild(|inner| inner.limiter = Some(Arc::new(Semaphore::new(limit.max(1)))))
    }

    /// How long `cancel` and `shutdown` wait for each scan to stop
    #[must_use]
    pub fn with_shutdown_timeout(self, timeout: Duration) -> Self {
        self.rebuild(|inner| inner.shutdown_timeout = timeout)
    }

    /// Stop tracking each scan as soon as it finishes
    ///
    /// `join` and `get_task_status` return `None` for pruned tasks; hard
    /// failures are still broadcast to [`failures`](Self::failures).
    #[must_use]
    pub fn with_auto_cleanup(self) -> Self {
        self.rebuild(|inner| inner.auto_cleanup = true)
    }

    fn rebuild(self, apply: impl FnOnce(&mut WorkerInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("ScanWorker already shared, ignoring configuration change");
                Self { inner }
            }
        }
    }

    /// Subscribe to hard scan failures
    pub fn failures(&self) -> broadcast::Receiver<TaskFailure> {
        self.inner.failures.subscribe()
    }

    /// Cancel a specific scan by ID
    ///
    /// Closes the scan's stream with [`ClosureReason::Cancelled`] and waits
    /// up to the shutdown timeout for the scan to stop. Returns `false` if
    /// the task is unknown.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some((closer, join_handle)) = self
            .inner
            .tasks
            .get(task_id)
            .map(|task| (task.closer.clone(), task.join_handle.clone()))
        else {
            tracing::warn!(task_id = %task_id, "Task not found for cancellation");
            return false;
        };

        closer.try_close(ClosureReason::Cancelled);
        tracing::info!(task_id = %task_id, "Scan cancellation requested");

        let mut handle_lock = join_handle.lock().await;
        if let Some(handle) = handle_lock.take() {
            if tokio::time::timeout(self.inner.shutdown_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!(task_id = %task_id, "Scan did not stop within timeout");
            }
        }
        true
    }

    /// Wait for a scan to finish and return its final status
    pub async fn join(&self, task_id: &str) -> Option<TaskStatus> {
        let (join_handle, status) = self
            .inner
            .tasks
            .get(task_id)
            .map(|task| (task.join_handle.clone(), task.status.clone()))?;

        let handle = join_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(task_id = %task_id, error = %e, "Scan supervisor panicked");
            }
        }
        let status = status.lock().await.clone();
        Some(status)
    }

    /// Get the status of a specific task
    pub async fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        let status = self.inner.tasks.get(task_id).map(|task| task.status.clone())?;
        let status = status.lock().await.clone();
        Some(status)
    }

    /// Snapshot of every tracked task
    pub async fn task_reports(&self) -> Vec<TaskReport> {
        let entries: Vec<_> = self
            .inner
            .tasks
            .iter()
            .map(|task| {
                (
                    task.task_id.clone(),
                    task.statement.clone(),
                    task.submitted_at,
                    task.status.clone(),
                )
            })
            .collect();

        let mut reports = Vec::with_capacity(entries.len());
        for (task_id, statement, submitted_at, status) in entries {
            reports.push(TaskReport {
                task_id,
                statement,
                submitted_at,
                status: status.lock().await.clone(),
            });
        }
        reports.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        reports
    }

    /// Get the count of tracked tasks
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Get the count of running tasks
    pub async fn running_task_count(&self) -> usize {
        let statuses: Vec<_> = self
            .inner
            .tasks
            .iter()
            .map(|task| task.status.clone())
            .collect();

        let mut count = 0;
        for status in statuses {
            if *status.lock().await == TaskStatus::Running {
                count += 1;
            }
        }
        count
    }

    /// Check if a task exists
    #[must_use]
    pub fn has_task(&self, task_id: &str) -> bool {
        self.inner.tasks.contains_key(task_id)
    }

    /// Remove finished tasks from tracking
    pub async fn cleanup_finished_tasks(&self) {
        let statuses: Vec<_> = self
            .inner
            .tasks
            .iter()
            .map(|task| (task.task_id.clone(), task.status.clone()))
            .collect();

        for (task_id, status) in statuses {
            if status.lock().await.is_finished() {
                self.inner.tasks.remove(&task_id);
            }
        }
    }

    /// Cancel every scan and wait for them to stop
    ///
    /// Scans scheduled after shutdown are rejected and their streams closed.
    pub async fn shutdown(&self) {
        self.inner.root_token.cancel();

        let entries: Vec<_> = self
            .inner
            .tasks
            .iter()
            .map(|task| {
                (
                    task.task_id.clone(),
                    task.closer.clone(),
                    task.join_handle.clone(),
                )
            })
            .collect();

        if entries.is_empty() {
            tracing::info!("ScanWorker stopping with no tracked scans");
            return;
        }

        tracing::info!(task_count = entries.len(), "ScanWorker stopping, cancelling all scans...");

        for (_, closer, _) in &entries {
            closer.try_close(ClosureReason::Cancelled);
        }

        for (task_id, _, join_handle) in entries {
            let mut handle_lock = join_handle.lock().await;
            if let Some(handle) = handle_lock.take() {
                match tokio::time::timeout(self.inner.shutdown_timeout, handle).await {
                    Ok(Ok(())) => {
                        tracing::debug!(task_id = %task_id, "Scan shutdown complete");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            task_id = %task_id,
                            error = %e,
                            "Scan supervisor panicked during shutdown"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(task_id = %task_id, "Scan shutdown timed out");
                    }
                }
            }
        }

        tracing::info!("All scans stopped");
    }
}

async fn supervise(
    task: ScanTask,
    status: Arc<Mutex<TaskStatus>>,
    limiter: Option<Arc<Semaphore>>,
    failures: broadcast::Sender<TaskFailure>,
) {
    let task_id = task.id().to_string();
    let statement = task.statement().to_string();
    let closer = task.closer().clone();

    let _permit = match limiter {
        Some(limiter) => {
            tokio::select! {
                biased;

                () = closer.closed() => {
                    tracing::debug!(task_id = %task_id, "Scan closed while waiting for a slot");
                    *status.lock().await = TaskStatus::Cancelled;
                    return;
                }
                permit = limiter.acquire_owned() => permit.ok(),
            }
        }
        None => None,
    };

    if closer.is_closed() {
        *status.lock().await = TaskStatus::Cancelled;
        return;
    }

    *status.lock().await = TaskStatus::Running;
    tracing::debug!(task_id = %task_id, statement = %statement, "Scan started");

    let outcome = match tokio::task::spawn_blocking(move || task.run()).await {
        Ok(result) => result,
        Err(join_error) => {
            closer.try_close(ClosureReason::SourceFailure);
            Err(ScanError::new(
                ScanErrorKind::Other,
                format!("scan task panicked: {}", join_error),
            ))
        }
    };

    let final_status = match outcome {
        Ok(()) => match closer.reason() {
            None => TaskStatus::Completed,
            Some(ClosureReason::Cancelled) => TaskStatus::Cancelled,
            Some(reason) => TaskStatus::Closed(reason),
        },
        Err(error) => {
            tracing::warn!(task_id = %task_id, error = %error, "Scan failed");
            let message = error.to_string();
            // No listeners is fine; the status still records the failure
            let _ = failures.send(TaskFailure {
                task_id: task_id.clone(),
                statement,
                error,
            });
            TaskStatus::Failed(message)
        }
    };

    tracing::debug!(task_id = %task_id, status = ?final_status, "Scan finished");
    *status.lock().await = final_status;
}

impl Scheduler for ScanWorker {
    fn schedule(&self, task: ScanTask, handle: &Handle) {
        let task_id = task.id().to_string();
        let statement = task.statement().to_string();
        let closer = task.closer().clone();

        if self.inner.root_token.is_cancelled() {
            tracing::warn!(task_id = %task_id, "ScanWorker is shut down, rejecting scan");
            closer.try_close(ClosureReason::Cancelled);
            return;
        }

        let status = Arc::new(Mutex::new(TaskStatus::Pending));
        let join_handle = Arc::new(Mutex::new(None));

        // Track before spawning so a fast scan can prune its own entry
        self.inner.tasks.insert(
            task_id.clone(),
            TaskInfo {
                task_id: task_id.clone(),
                statement,
                submitted_at: Utc::now(),
                join_handle: join_handle.clone(),
                closer,
                status: status.clone(),
            },
        );

        let supervised = supervise(
            task,
            status,
            self.inner.limiter.clone(),
            self.inner.failures.clone(),
        );
        let prune = self
            .inner
            .auto_cleanup
            .then(|| (Arc::downgrade(&self.inner), task_id.clone()));
        let join = handle.spawn(async move {
            supervised.await;
            if let Some((inner, task_id)) = prune {
                if let Some(inner) = inner.upgrade() {
                    inner.tasks.remove(&task_id);
                }
            }
        });

        match join_handle.try_lock() {
            Ok(mut slot) => *slot = Some(join),
            Err(_) => {
                tracing::debug!(task_id = %task_id, "Scan handle busy, task left detached");
            }
        }
        tracing::info!(task_id = %task_id, "Scan submitted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task(statement: &str, closer: SessionCloser, job: super::super::ScanJob) -> ScanTask {
        ScanTask::new(statement, closer, job)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completed_task() {
        let worker = ScanWorker::new();
        let scan = task("SELECT 1", SessionCloser::default(), Box::new(|| Ok(())));
        let task_id = scan.id().to_string();

        worker.schedule(scan, &Handle::current());
        assert!(worker.has_task(&task_id));
        assert_eq!(worker.task_count(), 1);

        assert_eq!(worker.join(&task_id).await, Some(TaskStatus::Completed));
        assert_eq!(
            worker.get_task_status(&task_id).await,
            Some(TaskStatus::Completed)
        );

        worker.cleanup_finished_tasks().await;
        assert_eq!(worker.task_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_is_broadcast() {
        let worker = ScanWorker::new();
        let mut failures = worker.failures();
        let scan = task(
            "SELECT * FROM missing",
            SessionCloser::default(),
            Box::new(|| Err(ScanError::query_failed("relation does not exist"))),
        );
        let task_id = scan.id().to_string();

        worker.schedule(scan, &Handle::current());

        let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.task_id, task_id);
        assert_eq!(failure.statement, "SELECT * FROM missing");

        match worker.join(&task_id).await {
            Some(TaskStatus::Failed(message)) => {
                assert!(message.contains("relation does not exist"))
            }
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_scan_reports_reason() {
        let worker = ScanWorker::new();
        let closer = SessionCloser::default();
        let inner = closer.clone();
        let scan = task(
            "SELECT 1",
            closer,
            Box::new(move || {
                inner.try_close(ClosureReason::ConsumerTimeout);
                Ok(())
            }),
        );
        let task_id = scan.id().to_string();

        worker.schedule(scan, &Handle::current());
        assert_eq!(
            worker.join(&task_id).await,
            Some(TaskStatus::Closed(ClosureReason::ConsumerTimeout))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrency_limit() {
        let worker = ScanWorker::new().with_max_concurrency(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            let scan = task(
                "SELECT pg_sleep(0.02)",
                SessionCloser::default(),
                Box::new(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
            ids.push(scan.id().to_string());
            worker.schedule(scan, &Handle::current());
        }

        for id in &ids {
            assert_eq!(worker.join(id).await, Some(TaskStatus::Completed));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_closes_session() {
        let worker = ScanWorker::new();
        let closer = SessionCloser::default();
        let observed = closer.clone();
        let scan = task(
            "SELECT * FROM big_table",
            closer,
            Box::new(move || {
                while !observed.is_closed() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }),
        );
        let task_id = scan.id().to_string();
        worker.schedule(scan, &Handle::current());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.cancel(&task_id).await);
        assert_eq!(
            worker.get_task_status(&task_id).await,
            Some(TaskStatus::Cancelled)
        );
        assert!(!worker.cancel("scan-unknown").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_rejects_new_scans() {
        let worker = ScanWorker::new();
        worker.shutdown().await;

        let closer = SessionCloser::default();
        let scan = task("SELECT 1", closer.clone(), Box::new(|| Ok(())));
        worker.schedule(scan, &Handle::current());

        assert_eq!(closer.reason(), Some(ClosureReason::Cancelled));
        assert_eq!(worker.task_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auto_cleanup_prunes_finished_tasks() {
        let worker = ScanWorker::new().with_auto_cleanup();
        let mut failures = worker.failures();

        for n in 0..10 {
            let job: super::super::ScanJob = if n == 9 {
                Box::new(|| Err(ScanError::query_failed("permission denied")))
            } else {
                Box::new(|| Ok(()))
            };
            worker.schedule(task("SELECT 1", SessionCloser::default(), job), &Handle::current());
        }

        let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.error.kind, ScanErrorKind::QueryFailed);

        for _ in 0..100 {
            if worker.task_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(worker.task_count(), 0);
        assert!(!worker.has_task(&failure.task_id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_task_reports() {
        let worker = ScanWorker::from_config(&StreamConfig::default());
        let scan = task("SELECT 42", SessionCloser::default(), Box::new(|| Ok(())));
        let task_id = scan.id().to_string();
        worker.schedule(scan, &Handle::current());
        worker.join(&task_id).await;

        let reports = worker.task_reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].statement, "SELECT 42");
        assert_eq!(reports[0].status, TaskStatus::Completed);
        assert_eq!(worker.running_task_count().await, 0);
    }
}
