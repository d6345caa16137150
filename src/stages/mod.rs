//! Composable pipeline stages.
//!
//! Every stage reads zero or more input channels and writes one or more
//! output channels, driven by a task of its own. A stage is the only writer
//! of its outputs and closes each of them exactly once, when it stops for any
//! reason: exhausted input, cancellation, or failure.
//!
//! The free functions in this module spawn detached tasks that end on their
//! own when input runs out or the token fires. [`crate::pipeline::Pipeline`]
//! offers the same stages with tasks it owns and waits for.
//!
//! ## Example
//!
//! ```rust
//! use std::convert::Infallible;
//! use conflux::prelude::*;
//! use conflux::stages;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let token = CancelToken::new();
//! let numbers = stages::generate(0..10, 4, &token);
//! let evens = stages::filter(numbers, |x: &i32| x % 2 == 0, 4, &token);
//! let squares = stages::transform(
//!     evens,
//!     |x: i32| Ok::<_, Infallible>(x * x),
//!     ErrorPolicy::Propagate,
//!     4,
//!     &token,
//! );
//! let collected = stages::collect(squares.output, &token).await;
//! assert_eq!(collected.items, vec![0, 4, 16, 36, 64]);
//! # }
//! ```

mod fan;
mod processors;
mod sinks;
mod sources;

use std::future::Future;
use std::sync::Arc;

use tracing::Instrument;

use crate::cancel::{CancelCause, CancelToken};
use crate::channel::{self, Receiver, SendError, Sender};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::telemetry;

pub use sinks::collect;

/// Slots in the error channel of a transform built by [`transform`].
pub const ERROR_CAPACITY: usize = 64;

/// What a transform does when its function fails.
///
/// There is no implicit default at the stage level: every transform is built
/// with an explicit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorPolicy {
    /// Offer each error on the side channel and keep going
    Propagate,
    /// Send the first error on the side channel, then stop the stage
    FailFast,
}

/// Outputs of a transform stage.
#[derive(Debug)]
pub struct Transformed<U> {
    /// Successfully transformed values
    pub output: Receiver<U>,
    /// [`Error::Operation`] values reported by the transform function
    pub errors: Receiver<Error>,
}

/// Values drained from a channel, plus the reason if draining stopped early.
#[derive(Debug, Clone)]
pub struct Collected<T> {
    pub items: Vec<T>,
    /// Set when a cancellation cut collection short
    pub cancelled: Option<CancelCause>,
}

impl<T> Collected<T> {
    /// True if every value was collected.
    pub fn is_complete(&self) -> bool {
        self.cancelled.is_none()
    }

    /// The items, or the cancellation as an error.
    pub fn into_result(self) -> Result<Vec<T>> {
        match self.cancelled {
            None => Ok(self.items),
            Some(cause) => Err(Error::Cancelled(cause)),
        }
    }
}

/// Somewhere to run a stage's driving task.
pub(crate) trait Spawn {
    fn spawn_stage<F>(&self, stage: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static;
}

/// Runs stage tasks on the ambient runtime without keeping their handles.
pub(crate) struct Detached;

impl Spawn for Detached {
    fn spawn_stage<F>(&self, stage: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(
            async move {
                if let Err(err) = task.await {
                    tracing::warn!(error = %err, "detached stage failed");
                }
            }
            .instrument(tracing::debug_span!("stage", name = stage)),
        );
    }
}

pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Send one value downstream. Any failure to deliver means the stage stops:
/// cancellation, or a downstream that went away.
pub(crate) async fn emit<T>(
    tx: &Sender<T>,
    value: T,
    token: &CancelToken,
    stage: &'static str,
) -> Flow {
    match tx.send(value, token).await {
        Ok(()) => {
            telemetry::stage_item(stage);
            Flow::Continue
        }
        Err(SendError::Cancelled(..)) => Flow::Stop,
        Err(err) => {
            tracing::debug!(error = %err, "downstream gone");
            Flow::Stop
        }
    }
}

/// Emit `values` in order, closing the output when exhausted or when `token`
/// fires.
pub fn generate<I>(values: I, capacity: usize, token: &CancelToken) -> Receiver<I::Item>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    spawn_generate(&Detached, values, capacity, token)
}

/// Apply `f` to every input value. Errors are handled according to `policy`.
///
/// Errors go to a channel of [`ERROR_CAPACITY`] slots. Errors arriving while
/// it is full are dropped rather than stalling the stage.
pub fn transform<T, U, E, F>(
    input: Receiver<T>,
    f: F,
    policy: ErrorPolicy,
    capacity: usize,
    token: &CancelToken,
) -> Transformed<U>
where
    T: Send + 'static,
    U: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(T) -> std::result::Result<U, E> + Send + 'static,
{
    spawn_transform(&Detached, input, f, policy, capacity, ERROR_CAPACITY, token)
}

/// Forward only the values for which `predicate` holds.
pub fn filter<T, P>(
    input: Receiver<T>,
    predicate: P,
    capacity: usize,
    token: &CancelToken,
) -> Receiver<T>
where
    T: Send + 'static,
    P: FnMut(&T) -> bool + Send + 'static,
{
    spawn_filter(&Detached, input, predicate, capacity, token)
}

/// Duplicate `input` into `fanout` independent streams.
///
/// Each value is delivered to every output before the next value is read,
/// so the slowest consumer sets the pace and back-pressure reaches the
/// producer. An output whose receivers are all dropped is pruned. Fails
/// with [`Error::Config`] if `fanout` is zero.
pub fn tee<T>(
    input: Receiver<T>,
    fanout: usize,
    capacity: usize,
    token: &CancelToken,
) -> Result<Vec<Receiver<T>>>
where
    T: Clone + Send + 'static,
{
    spawn_tee(&Detached, input, fanout, capacity, token)
}

/// Combine `inputs` into one stream. Interleaving across inputs is
/// unspecified; the output closes once every input has closed.
pub fn merge<T>(inputs: Vec<Receiver<T>>, capacity: usize, token: &CancelToken) -> Receiver<T>
where
    T: Send + 'static,
{
    spawn_merge(&Detached, inputs, capacity, token)
}

/// Admit each value through `limiter`, one token per value.
pub fn throttle<T>(
    input: Receiver<T>,
    limiter: Arc<RateLimiter>,
    capacity: usize,
    token: &CancelToken,
) -> Receiver<T>
where
    T: Send + 'static,
{
    spawn_throttle(&Detached, input, limiter, capacity, token)
}

pub(crate) fn spawn_generate<S, I>(
    spawner: &S,
    values: I,
    capacity: usize,
    token: &CancelToken,
) -> Receiver<I::Item>
where
    S: Spawn,
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let (tx, rx) = channel::bounded(capacity);
    spawner.spawn_stage(
        "generate",
        sources::generate(values.into_iter(), tx, token.clone()),
    );
    rx
}

pub(crate) fn spawn_transform<S, T, U, E, F>(
    spawner: &S,
    input: Receiver<T>,
    f: F,
    policy: ErrorPolicy,
    capacity: usize,
    error_capacity: usize,
    token: &CancelToken,
) -> Transformed<U>
where
    S: Spawn,
    T: Send + 'static,
    U: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(T) -> std::result::Result<U, E> + Send + 'static,
{
    let (tx, output) = channel::bounded(capacity);
    let (errors_tx, errors) = channel::bounded(error_capacity);
    spawner.spawn_stage(
        "transform",
        processors::transform(input, f, policy, tx, errors_tx, token.clone()),
    );
    Transformed { output, errors }
}

pub(crate) fn spawn_filter<S, T, P>(
    spawner: &S,
    input: Receiver<T>,
    predicate: P,
    capacity: usize,
    token: &CancelToken,
) -> Receiver<T>
where
    S: Spawn,
    T: Send + 'static,
    P: FnMut(&T) -> bool + Send + 'static,
{
    let (tx, rx) = channel::bounded(capacity);
    spawner.spawn_stage(
        "filter",
        processors::filter(input, predicate, tx, token.clone()),
    );
    rx
}

pub(crate) fn spawn_tee<S, T>(
    spawner: &S,
    input: Receiver<T>,
    fanout: usize,
    capacity: usize,
    token: &CancelToken,
) -> Result<Vec<Receiver<T>>>
where
    S: Spawn,
    T: Clone + Send + 'static,
{
    if fanout == 0 {
        return Err(Error::config("tee needs at least one output"));
    }
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..fanout).map(|_| channel::bounded(capacity)).unzip();
    spawner.spawn_stage("tee", fan::tee(input, senders, token.clone()));
    Ok(receivers)
}

pub(crate) fn spawn_merge<S, T>(
    spawner: &S,
    inputs: Vec<Receiver<T>>,
    capacity: usize,
    token: &CancelToken,
) -> Receiver<T>
where
    S: Spawn,
    T: Send + 'static,
{
    let (tx, rx) = channel::bounded(capacity);
    spawner.spawn_stage("merge", fan::merge(inputs, tx, token.clone()));
    rx
}

pub(crate) fn spawn_throttle<S, T>(
    spawner: &S,
    input: Receiver<T>,
    limiter: Arc<RateLimiter>,
    capacity: usize,
    token: &CancelToken,
) -> Receiver<T>
where
    S: Spawn,
    T: Send + 'static,
{
    let (tx, rx) = channel::bounded(capacity);
    spawner.spawn_stage(
        "throttle",
        processors::throttle(input, limiter, tx, token.clone()),
    );
    rx
}
