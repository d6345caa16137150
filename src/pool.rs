//! A fixed-size pool of workers draining a bounded job queue.
//!
//! Jobs are submitted with [`WorkerPool::submit`] and their results read from
//! the [`ResultStream`] returned by [`WorkerPool::results`]. A failing job
//! never stops the pool: its error is delivered as that job's result. Only
//! cancellation of the governing token or [`WorkerPool::shutdown`] stops the
//! workers.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, Stream};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::cancel::{CancelCause, CancelToken};
use crate::channel::{self, Receiver, SendError, Sender, TrySendError};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::stages::Collected;
use crate::telemetry;

/// The unit of work a pool runs for each submitted input.
///
/// Implemented for every `Fn(T) -> impl Future<Output = Result<R, E>>`
/// closure, so most callers never implement it by hand.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use conflux::pool::Operation;
///
/// struct Square;
///
/// #[async_trait]
/// impl Operation<u64> for Square {
///     type Output = u64;
///     type Error = std::convert::Infallible;
///
///     async fn call(&self, input: u64) -> Result<u64, Self::Error> {
///         Ok(input * input)
///     }
/// }
/// ```
#[async_trait]
pub trait Operation<T: Send + 'static>: Send + Sync + 'static {
    /// The value produced by a successful call
    type Output: Send + 'static;
    /// The failure reported by an unsuccessful call
    type Error: std::error::Error + Send + Sync + 'static;

    async fn call(&self, input: T) -> std::result::Result<Self::Output, Self::Error>;
}

#[async_trait]
impl<T, F, Fut, R, E> Operation<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send,
    R: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Output = R;
    type Error = E;

    async fn call(&self, input: T) -> std::result::Result<R, E> {
        (self)(input).await
    }
}

/// Order in which a [`ResultStream`] yields results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResultOrdering {
    /// As jobs finish
    #[default]
    Completion,
    /// In submission order, buffering early finishers
    Submission,
}

/// Configuration for a [`WorkerPool`]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Jobs buffered ahead of the workers (0 hands jobs over directly)
    pub queue_capacity: usize,
    /// Results buffered ahead of the reader
    pub result_capacity: usize,
    /// Result ordering policy
    pub ordering: ResultOrdering,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 64,
            result_capacity: 64,
            ordering: ResultOrdering::Completion,
        }
    }
}

impl PoolConfig {
    /// Set the number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the job queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the result buffer capacity
    pub fn result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = capacity;
        self
    }

    /// Set the result ordering policy
    pub fn ordering(mut self, ordering: ResultOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("worker pool needs at least one worker"));
        }
        Ok(())
    }
}

/// Submission sequence number of a job, starting at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

struct Job<T> {
    id: JobId,
    input: T,
}

/// The outcome of one job: its value or its error.
#[derive(Debug, Clone)]
pub struct JobResult<R> {
    pub id: JobId,
    pub result: Result<R>,
}

impl<R> JobResult<R> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Totals reported once every worker has exited.
#[derive(Debug, Clone)]
pub struct PoolSummary {
    /// Jobs whose operation succeeded
    pub completed: u64,
    /// Jobs whose operation failed
    pub failed: u64,
    /// Set if the pool stopped because its token fired
    pub cancelled: Option<CancelCause>,
}

#[derive(Default)]
struct PoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// The submitting half of a pool: the job queue and the id counter.
///
/// Owns no results, so it can move into a feeder task whatever `R` is.
pub(crate) struct Submitter<T> {
    jobs: Sender<Job<T>>,
    next_id: Arc<Mutex<u64>>,
    token: CancelToken,
    queue_capacity: usize,
}

impl<T> Clone for Submitter<T> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
            next_id: self.next_id.clone(),
            token: self.token.clone(),
            queue_capacity: self.queue_capacity,
        }
    }
}

impl<T: Send + 'static> Submitter<T> {
    // The id lock is held across the send so accepted ids stay contiguous.
    pub(crate) async fn submit(&self, input: T) -> Result<JobId> {
        let mut next_id = self.next_id.lock().await;
        let id = JobId(*next_id);
        match self.jobs.send(Job { id, input }, &self.token).await {
            Ok(()) => {
                *next_id += 1;
                tracing::trace!(%id, "job submitted");
                Ok(id)
            }
            Err(SendError::Closed(_)) | Err(SendError::Disconnected(_)) => Err(Error::Shutdown),
            Err(SendError::Cancelled(_, cause)) => Err(Error::Cancelled(cause)),
        }
    }

    pub(crate) fn try_submit(&self, input: T) -> Result<JobId> {
        let full = || Error::capacity(self.jobs.len(), self.queue_capacity);
        let Ok(mut next_id) = self.next_id.try_lock() else {
            return Err(full());
        };
        if self.token.is_cancelled() {
            return Err(self.token.cancelled_error());
        }
        let id = JobId(*next_id);
        match self.jobs.try_send(Job { id, input }) {
            Ok(()) => {
                *next_id += 1;
                Ok(id)
            }
            Err(TrySendError::Full(_)) => Err(full()),
            Err(TrySendError::Closed(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(Error::Shutdown)
            }
        }
    }

    pub(crate) async fn feed(&self, input: Receiver<T>) -> Result<u64> {
        let mut fed = 0;
        while let Some(value) = input.recv(&self.token).await? {
            self.submit(value).await?;
            fed += 1;
        }
        Ok(fed)
    }

    pub(crate) fn shutdown(&self) {
        if self.jobs.close().is_ok() {
            tracing::debug!("worker pool shutting down");
        }
    }

    async fn submitted(&self) -> u64 {
        *self.next_id.lock().await
    }
}

/// A fixed set of workers running an [`Operation`] over submitted inputs.
pub struct WorkerPool<T, R> {
    submitter: Submitter<T>,
    results: Option<ResultStream<R>>,
    token: CancelToken,
    tracker: TaskTracker,
    aborts: Vec<AbortHandle>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Start a pool. Must be called from within a Tokio runtime.
    pub fn new<O>(config: PoolConfig, op: O, token: CancelToken) -> Result<Self>
    where
        O: Operation<T, Output = R>,
    {
        Self::spawn(config, op, None, token)
    }

    /// Start a pool of `workers` workers with default queue sizes.
    pub fn with_workers<O>(workers: usize, op: O, token: CancelToken) -> Result<Self>
    where
        O: Operation<T, Output = R>,
    {
        Self::new(PoolConfig::default().workers(workers), op, token)
    }

    /// Start a pool whose workers take one token from `limiter` before each
    /// job.
    pub fn rate_limited<O>(
        config: PoolConfig,
        op: O,
        limiter: Arc<RateLimiter>,
        token: CancelToken,
    ) -> Result<Self>
    where
        O: Operation<T, Output = R>,
    {
        Self::spawn(config, op, Some(limiter), token)
    }

    fn spawn<O>(
        config: PoolConfig,
        op: O,
        limiter: Option<Arc<RateLimiter>>,
        token: CancelToken,
    ) -> Result<Self>
    where
        O: Operation<T, Output = R>,
    {
        config.validate()?;

        let (jobs_tx, jobs_rx) = channel::bounded(config.queue_capacity);
        let (results_tx, results_rx) = channel::bounded(config.result_capacity);
        let op = Arc::new(op);
        let stats = Arc::new(PoolStats::default());
        let tracker = TaskTracker::new();
        let mut aborts = Vec::with_capacity(config.workers);

        for index in 0..config.workers {
            let worker = Worker {
                jobs: jobs_rx.clone(),
                results: results_tx.clone(),
                op: op.clone(),
                limiter: limiter.clone(),
                token: token.clone(),
                stats: stats.clone(),
            };
            let handle = tracker.spawn(
                worker
                    .run()
                    .instrument(tracing::debug_span!("worker", index)),
            );
            aborts.push(handle.abort_handle());
        }
        tracker.close();
        tracing::debug!(workers = config.workers, "worker pool started");

        Ok(Self {
            submitter: Submitter {
                jobs: jobs_tx,
                next_id: Arc::new(Mutex::new(0)),
                token: token.clone(),
                queue_capacity: config.queue_capacity,
            },
            results: Some(ResultStream::new(results_rx, config.ordering, token.clone())),
            token,
            tracker,
            aborts,
            stats,
            config,
        })
    }

    /// Enqueue a job, waiting while the queue is full.
    ///
    /// Fails with [`Error::Shutdown`] once the pool stops accepting jobs and
    /// with [`Error::Cancelled`] if the pool's token fires while waiting.
    pub async fn submit(&self, input: T) -> Result<JobId> {
        self.submitter.submit(input).await
    }

    /// Enqueue a job without waiting. A full queue, or a concurrent blocked
    /// submitter, yields [`Error::Capacity`].
    pub fn try_submit(&self, input: T) -> Result<JobId> {
        self.submitter.try_submit(input)
    }

    /// Take the result stream. Returns `None` after the first call.
    pub fn results(&mut self) -> Option<ResultStream<R>> {
        self.results.take()
    }

    /// Stop accepting jobs. Queued and in-flight jobs still run; the result
    /// stream ends after the last worker exits. Calling twice is harmless.
    pub fn shutdown(&self) {
        self.submitter.shutdown();
    }

    /// Number of jobs accepted so far.
    pub async fn submitted(&self) -> u64 {
        self.submitter.submitted().await
    }

    /// Submit every value read from `input` until it closes. Returns how many
    /// jobs were submitted. Does not shut the pool down.
    pub async fn feed(&self, input: Receiver<T>) -> Result<u64> {
        self.submitter.feed(input).await
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Wait for every worker to exit. Call [`WorkerPool::shutdown`] (or
    /// cancel the token) first, and keep draining results, or this waits
    /// forever.
    pub async fn join(&self) -> PoolSummary {
        self.tracker.wait().await;
        self.summary()
    }

    /// Current totals without waiting.
    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            cancelled: self.token.cause(),
        }
    }

    pub(crate) fn submitter(&self) -> Submitter<T> {
        self.submitter.clone()
    }

    pub(crate) fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub(crate) fn abort_handles(&self) -> Vec<AbortHandle> {
        self.aborts.clone()
    }
}

struct Worker<T, O, R> {
    jobs: Receiver<Job<T>>,
    results: Sender<JobResult<R>>,
    op: Arc<O>,
    limiter: Option<Arc<RateLimiter>>,
    token: CancelToken,
    stats: Arc<PoolStats>,
}

impl<T, O, R> Worker<T, O, R>
where
    T: Send + 'static,
    R: Send + 'static,
    O: Operation<T, Output = R>,
{
    async fn run(self) {
        tracing::debug!("worker started");
        loop {
            let job = match self.jobs.recv(&self.token).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => break,
            };

            // A job already taken is completed even if the token fires now.
            let result = self.execute(job.input).await;
            let ok = result.is_ok();
            let counter = if ok {
                &self.stats.completed
            } else {
                &self.stats.failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
            telemetry::job_finished(ok);
            if let Err(err) = &result {
                tracing::warn!(id = %job.id, error = %err, "job failed");
            }

            let outcome = JobResult { id: job.id, result };
            match self.results.send(outcome, &self.token).await {
                Ok(()) => {}
                Err(SendError::Cancelled(outcome, _)) => {
                    // Publish without blocking if there is room, then stop.
                    let id = outcome.id;
                    match self.results.try_send(outcome) {
                        Ok(()) => tracing::debug!(%id, "result published after cancellation"),
                        Err(err) if err.is_full() => {
                            tracing::warn!(%id, "result buffer full after cancellation, dropping result")
                        }
                        Err(_) => tracing::debug!(%id, "no reader left for result"),
                    }
                    break;
                }
                // Nobody reads results any more; keep running jobs.
                Err(_) => {}
            }
        }
        tracing::debug!(cancelled = self.token.is_cancelled(), "worker stopped");
    }

    async fn execute(&self, input: T) -> Result<R> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(1.0, &self.token).await?;
        }
        match AssertUnwindSafe(self.op.call(input)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::operation(err)),
            Err(panic) => Err(Error::TaskFailed(panic_message(panic.as_ref()))),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

/// Results of a [`WorkerPool`], one per accepted job.
///
/// Ends when every worker has exited, or early if the pool's token fires; in
/// the latter case [`ResultStream::cancelled`] reports the cause.
pub struct ResultStream<R> {
    rx: Receiver<JobResult<R>>,
    ordering: ResultOrdering,
    token: CancelToken,
    pending: BTreeMap<u64, JobResult<R>>,
    next_id: u64,
    cancelled: Option<CancelCause>,
}

impl<R: Send + 'static> ResultStream<R> {
    fn new(rx: Receiver<JobResult<R>>, ordering: ResultOrdering, token: CancelToken) -> Self {
        Self {
            rx,
            ordering,
            token,
            pending: BTreeMap::new(),
            next_id: 0,
            cancelled: None,
        }
    }

    /// The next result, or `None` once the stream is finished.
    ///
    /// After the token fires, results already published by the workers are
    /// still yielded before the stream ends; [`ResultStream::cancelled`] then
    /// reports the cause.
    pub async fn next(&mut self) -> Option<JobResult<R>> {
        loop {
            if self.ordering == ResultOrdering::Submission {
                if let Some(result) = self.pending.remove(&self.next_id) {
                    self.next_id += 1;
                    return Some(result);
                }
            }
            if self.cancelled.is_some() {
                return self.drain_next();
            }
            match self.rx.recv(&self.token).await {
                Ok(Some(result)) => match self.ordering {
                    ResultOrdering::Completion => return Some(result),
                    ResultOrdering::Submission => {
                        self.pending.insert(result.id.0, result);
                    }
                },
                // Closed: release anything still held back, gaps and all.
                Ok(None) => return self.drain_next(),
                Err(err) => {
                    let cause = match err {
                        Error::Cancelled(cause) => cause,
                        _ => self.token.cause().unwrap_or(CancelCause::Requested),
                    };
                    tracing::debug!(%cause, buffered = self.rx.len(), "result stream cancelled");
                    self.cancelled = Some(cause);
                }
            }
        }
    }

    // Take whatever is left without waiting, lowest id first when ordered.
    fn drain_next(&mut self) -> Option<JobResult<R>> {
        while let Ok(result) = self.rx.try_recv() {
            match self.ordering {
                ResultOrdering::Completion => return Some(result),
                ResultOrdering::Submission => {
                    self.pending.insert(result.id.0, result);
                }
            }
        }
        let (id, result) = self.pending.pop_first()?;
        self.next_id = id + 1;
        Some(result)
    }

    /// Why the stream ended early, if it did.
    pub fn cancelled(&self) -> Option<&CancelCause> {
        self.cancelled.as_ref()
    }

    /// Drain the stream.
    pub async fn collect_all(mut self) -> Collected<JobResult<R>> {
        let mut items = Vec::new();
        while let Some(result) = self.next().await {
            items.push(result);
        }
        Collected {
            items,
            cancelled: self.cancelled,
        }
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = JobResult<R>> + Send + 'static {
        futures::stream::unfold(self, |mut results| async move {
            results.next().await.map(|r| (r, results))
        })
    }
}
