//! Pipeline assembly and lifecycle.
//!
//! A [`Pipeline`] owns a root [`CancelToken`] and every task started through
//! it: stages, worker pool workers and the feeders between them. Stopping the
//! pipeline cancels the root token and waits until each of those tasks has
//! returned, so nothing outlives [`PipelineHandle::stop`].

mod config;

pub use config::PipelineConfig;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::cancel::{CancelCause, CancelToken};
use crate::channel::Receiver;
use crate::error::{Error, Result};
use crate::pool::{panic_message, Operation, ResultStream, WorkerPool};
use crate::rate_limit::RateLimiter;
use crate::stages::{self, Collected, ErrorPolicy, Spawn, Transformed};

struct Shared {
    token: CancelToken,
    tracker: TaskTracker,
    aborts: Mutex<Vec<AbortHandle>>,
    // Worker trackers of pools started through the pipeline
    pools: Mutex<Vec<TaskTracker>>,
    failure: Mutex<Option<Error>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    // Record the first real failure and bring the rest of the pipeline down.
    fn fail(&self, stage: &'static str, err: Error) {
        if err.is_cancelled() {
            return;
        }
        tracing::warn!(stage, error = %err, "stage failed, cancelling pipeline");
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                *failure = Some(err.clone());
            }
        }
        self.token.cancel_with(CancelCause::Failed(Arc::new(err)));
    }

    fn failure(&self) -> Option<Error> {
        lock(&self.failure).clone()
    }

    async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn stop(&self, cause: CancelCause) {
        tracing::info!(%cause, tasks = self.tracker.len(), "stopping pipeline");
        self.token.cancel_with(cause);
        self.wait().await;
        tracing::info!("pipeline stopped");
    }
}

/// A cloneable handle for stopping a running pipeline from elsewhere.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Cancel the root token, then wait for every task the pipeline owns to
    /// return.
    pub async fn stop(&self, cause: CancelCause) {
        self.shared.stop(cause).await;
    }

    /// Like [`PipelineHandle::stop`], but abort any task still running after
    /// `grace` and report [`Error::Timeout`].
    pub async fn stop_within(&self, cause: CancelCause, grace: Duration) -> Result<()> {
        self.shared.token.cancel_with(cause);
        if tokio::time::timeout(grace, self.shared.wait()).await.is_ok() {
            return Ok(());
        }
        let aborts = std::mem::take(&mut *lock(&self.shared.aborts));
        tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            remaining = self.shared.tracker.len(),
            "pipeline tasks ignored cancellation, aborting"
        );
        for handle in aborts {
            handle.abort();
        }
        self.shared.wait().await;
        let pools = lock(&self.shared.pools).clone();
        for workers in pools {
            workers.wait().await;
        }
        Err(Error::timeout(grace))
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }
}

/// Wires stages together and manages their joint lifecycle.
///
/// # Example
///
/// ```rust
/// use std::convert::Infallible;
/// use conflux::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let pipeline = Pipeline::new(PipelineConfig::default().channel_capacity(4))?;
/// let numbers = pipeline.generate(0..10);
/// let evens = pipeline.filter(numbers, |x: &i32| x % 2 == 0);
/// let squares = pipeline.transform(evens, |x: i32| Ok::<_, Infallible>(x * x));
///
/// let completion = pipeline.run(squares.output).await?;
/// assert_eq!(completion.items, vec![0, 4, 16, 36, 64]);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    shared: Arc<Shared>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a pipeline with a fresh root token.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_root(CancelToken::new(), config))
    }

    /// Create a pipeline whose root token is derived from `parent`, so that
    /// cancelling `parent` stops the pipeline.
    pub fn with_parent(parent: &CancelToken, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_root(parent.derive(), config))
    }

    fn from_root(token: CancelToken, config: PipelineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                token,
                tracker: TaskTracker::new(),
                aborts: Mutex::new(Vec::new()),
                pools: Mutex::new(Vec::new()),
                failure: Mutex::new(None),
            }),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The root token every stage observes.
    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Emit `values` in order.
    pub fn generate<I>(&self, values: I) -> Receiver<I::Item>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: Send + 'static,
    {
        stages::spawn_generate(self, values, self.config.channel_capacity, self.token())
    }

    /// Apply `f` to every value, handling failures with the configured
    /// [`ErrorPolicy`].
    pub fn transform<T, U, E, F>(&self, input: Receiver<T>, f: F) -> Transformed<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut(T) -> std::result::Result<U, E> + Send + 'static,
    {
        self.transform_with(input, f, self.config.error_policy)
    }

    /// Apply `f` to every value with an explicit [`ErrorPolicy`].
    ///
    /// Under [`ErrorPolicy::FailFast`] the first failure cancels the whole
    /// pipeline and is returned from [`Pipeline::run`].
    pub fn transform_with<T, U, E, F>(
        &self,
        input: Receiver<T>,
        f: F,
        policy: ErrorPolicy,
    ) -> Transformed<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut(T) -> std::result::Result<U, E> + Send + 'static,
    {
        stages::spawn_transform(
            self,
            input,
            f,
            policy,
            self.config.channel_capacity,
            self.config.error_capacity,
            self.token(),
        )
    }

    /// Forward only values matching `predicate`.
    pub fn filter<T, P>(&self, input: Receiver<T>, predicate: P) -> Receiver<T>
    where
        T: Send + 'static,
        P: FnMut(&T) -> bool + Send + 'static,
    {
        stages::spawn_filter(
            self,
            input,
            predicate,
            self.config.channel_capacity,
            self.token(),
        )
    }

    /// Duplicate `input` into `fanout` streams paced by the slowest reader.
    pub fn tee<T>(&self, input: Receiver<T>, fanout: usize) -> Result<Vec<Receiver<T>>>
    where
        T: Clone + Send + 'static,
    {
        stages::spawn_tee(
            self,
            input,
            fanout,
            self.config.channel_capacity,
            self.token(),
        )
    }

    /// Combine several streams into one.
    pub fn merge<T>(&self, inputs: Vec<Receiver<T>>) -> Receiver<T>
    where
        T: Send + 'static,
    {
        stages::spawn_merge(self, inputs, self.config.channel_capacity, self.token())
    }

    /// Admit each value through `limiter`.
    pub fn throttle<T>(&self, input: Receiver<T>, limiter: Arc<RateLimiter>) -> Receiver<T>
    where
        T: Send + 'static,
    {
        stages::spawn_throttle(
            self,
            input,
            limiter,
            self.config.channel_capacity,
            self.token(),
        )
    }

    /// Start a worker pool governed by a child of the root token. The
    /// pipeline waits for its workers when it runs or stops.
    pub fn worker_pool<T, R, O>(&self, op: O) -> Result<WorkerPool<T, R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        O: Operation<T, Output = R>,
    {
        let pool = WorkerPool::new(self.config.pool.clone(), op, self.token().derive())?;
        self.watch_pool(&pool);
        Ok(pool)
    }

    /// Like [`Pipeline::worker_pool`], with each job admitted through
    /// `limiter`.
    pub fn rate_limited_pool<T, R, O>(
        &self,
        op: O,
        limiter: Arc<RateLimiter>,
    ) -> Result<WorkerPool<T, R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        O: Operation<T, Output = R>,
    {
        let pool = WorkerPool::rate_limited(
            self.config.pool.clone(),
            op,
            limiter,
            self.token().derive(),
        )?;
        self.watch_pool(&pool);
        Ok(pool)
    }

    /// Feed every value of `input` to a new worker pool and return its
    /// results. The pool shuts down once `input` closes.
    pub fn process<T, R, O>(&self, input: Receiver<T>, op: O) -> Result<ResultStream<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        O: Operation<T, Output = R>,
    {
        let pool = self.worker_pool(op)?;
        self.feed_pool(input, pool)
    }

    /// Like [`Pipeline::process`], with each job admitted through `limiter`.
    pub fn process_rate_limited<T, R, O>(
        &self,
        input: Receiver<T>,
        op: O,
        limiter: Arc<RateLimiter>,
    ) -> Result<ResultStream<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        O: Operation<T, Output = R>,
    {
        let pool = self.rate_limited_pool(op, limiter)?;
        self.feed_pool(input, pool)
    }

    fn feed_pool<T, R>(
        &self,
        input: Receiver<T>,
        mut pool: WorkerPool<T, R>,
    ) -> Result<ResultStream<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let results = pool
            .results()
            .ok_or_else(|| Error::config("worker pool results already taken"))?;
        let submitter = pool.submitter();
        drop(pool);
        self.spawn_stage("pool_feeder", async move {
            let fed = submitter.feed(input).await;
            submitter.shutdown();
            fed.map(|count| tracing::debug!(count, "pool feeder finished"))
        });
        Ok(results)
    }

    fn watch_pool<T, R>(&self, pool: &WorkerPool<T, R>)
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let workers = pool.tracker();
        lock(&self.shared.aborts).extend(pool.abort_handles());
        lock(&self.shared.pools).push(workers.clone());
        self.spawn_stage("worker_pool", async move {
            workers.wait().await;
            Ok(())
        });
    }

    /// Drain `output` until it closes or the pipeline is cancelled, then wait
    /// for every owned task.
    ///
    /// A cancelled pipeline still returns `Ok`, with the items collected so
    /// far and [`Collected::cancelled`] set. A stage failure (a fail-fast
    /// transform, a panic) is returned as the error.
    pub async fn run<T>(self, output: Receiver<T>) -> Result<Collected<T>>
    where
        T: Send + 'static,
    {
        let collected = stages::collect(output, self.token()).await;
        self.join().await?;
        Ok(collected)
    }

    /// Wait for every owned task to finish, for pipelines whose output is
    /// consumed elsewhere.
    pub async fn join(self) -> Result<()> {
        self.shared.wait().await;
        match self.shared.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancel the pipeline and wait for every owned task to return.
    pub async fn stop(&self, cause: CancelCause) {
        self.shared.stop(cause).await;
    }

    /// Stop using the configured grace period.
    pub async fn stop_gracefully(&self, cause: CancelCause) -> Result<()> {
        self.handle().stop_within(cause, self.config.stop_grace).await
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::from_root(CancelToken::new(), PipelineConfig::default())
    }
}

impl Spawn for Pipeline {
    fn spawn_stage<F>(&self, stage: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shared = self.shared.clone();
        let handle = self.shared.tracker.spawn(
            async move {
                let err = match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => err,
                    Err(panic) => Error::TaskFailed(panic_message(panic.as_ref())),
                };
                shared.fail(stage, err);
            }
            .instrument(tracing::debug_span!("stage", name = stage)),
        );
        lock(&self.shared.aborts).push(handle.abort_handle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("negative input {0}")]
    struct Negative(i32);

    #[tokio::test]
    async fn test_generate_filter_transform_collect() {
        let pipeline = Pipeline::default();
        let numbers = pipeline.generate(0..10);
        let evens = pipeline.filter(numbers, |x: &i32| x % 2 == 0);
        let squares = pipeline.transform(evens, |x: i32| Ok::<_, Infallible>(x * x));

        let completion = pipeline.run(squares.output).await.unwrap();
        assert_eq!(completion.items, vec![0, 4, 16, 36, 64]);
        assert!(completion.is_complete());
    }

    #[tokio::test]
    async fn test_fail_fast_transform_fails_the_run() {
        let pipeline =
            Pipeline::new(PipelineConfig::default().error_policy(ErrorPolicy::FailFast)).unwrap();
        let numbers = pipeline.generate(vec![1, 2, -3, 4, 5]);
        let checked = pipeline.transform(numbers, |x: i32| {
            if x < 0 {
                Err(Negative(x))
            } else {
                Ok(x)
            }
        });

        let err = pipeline.run(checked.output).await.unwrap_err();
        assert!(matches!(err, Error::Operation(_)));
        assert_eq!(err.to_string(), "operation failed: negative input -3");
    }

    #[tokio::test]
    async fn test_unread_error_channel_does_not_stall_run() {
        let config = PipelineConfig::default()
            .channel_capacity(1)
            .error_capacity(1)
            .error_policy(ErrorPolicy::Propagate);
        let pipeline = Pipeline::new(config).unwrap();
        let words = pipeline.generate(vec!["1", "x", "y", "z", "2"]);
        let parsed = pipeline.transform(words, |w: &str| w.parse::<u32>());
        let errors = parsed.errors;

        let completion = tokio::time::timeout(Duration::from_secs(2), pipeline.run(parsed.output))
            .await
            .expect("run completes without anyone reading errors")
            .unwrap();
        assert_eq!(completion.items, vec![1, 2]);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_every_task() {
        let pipeline = Pipeline::new(PipelineConfig::default().channel_capacity(0)).unwrap();
        let live = Arc::new(AtomicUsize::new(0));
        let counter = live.clone();

        let source = pipeline.generate(0..);
        let mut branches = pipeline.tee(source, 2).unwrap();
        let right = branches.pop().unwrap();
        let left = branches.pop().unwrap();
        let mapped = pipeline.transform(left, move |x: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(x)
        });
        // Nobody reads either branch, so the tee stalls.
        let handle = pipeline.handle();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.stop(CancelCause::reason("test over")).await;
        assert!(handle.is_stopped());
        assert!(pipeline.shared.tracker.is_empty());
        drop((right, mapped));
        assert!(live.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn test_stop_within_aborts_stuck_tasks() {
        let pipeline = Pipeline::default();
        pipeline.spawn_stage("stuck", async {
            // Ignores cancellation entirely.
            std::future::pending::<()>().await;
            Ok(())
        });

        let err = pipeline
            .handle()
            .stop_within(CancelCause::Requested, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(pipeline.shared.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_stop_within_aborts_pool_workers() {
        let pool = crate::pool::PoolConfig::default().workers(1);
        let pipeline = Pipeline::new(PipelineConfig::default().pool(pool)).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let workers = pipeline
            .worker_pool(move |x: u32| {
                let counter = counter.clone();
                async move {
                    // Not cancellable.
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(x)
                }
            })
            .unwrap();
        workers.submit(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = pipeline
            .handle()
            .stop_within(CancelCause::Requested, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { duration_ms: 20 }));
        assert!(workers.tracker().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parent_token_cancels_pipeline() {
        let parent = CancelToken::new();
        let pipeline = Pipeline::with_parent(&parent, PipelineConfig::default()).unwrap();
        let numbers = pipeline.generate(0..);
        parent.cancel_with(CancelCause::reason("shutdown"));

        let completion = pipeline.run(numbers).await.unwrap();
        assert!(matches!(
            completion.cancelled,
            Some(CancelCause::Reason(ref r)) if r == "shutdown"
        ));
    }

    #[tokio::test]
    async fn test_process_through_worker_pool() {
        let pool = crate::pool::PoolConfig::default()
            .workers(3)
            .ordering(crate::pool::ResultOrdering::Submission);
        let pipeline = Pipeline::new(PipelineConfig::default().pool(pool)).unwrap();
        let numbers = pipeline.generate(1..=20u64);
        let results = pipeline
            .process(numbers, |x: u64| async move { Ok::<_, Infallible>(x * 3) })
            .unwrap();

        let collected = results.collect_all().await;
        let values: Vec<u64> = collected.items.into_iter().map(|r| r.result.unwrap()).collect();
        assert_eq!(values, (1..=20).map(|x| x * 3).collect::<Vec<_>>());
        pipeline.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_pipeline() {
        let pipeline = Pipeline::default();
        let numbers = pipeline.generate(0..5);
        let boom = pipeline.filter(numbers, |x: &i32| {
            if *x == 3 {
                panic!("bad predicate");
            }
            true
        });
        let err = pipeline.run(boom).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed(ref msg) if msg == "bad predicate"));
    }
}
