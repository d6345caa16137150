//! One-in, one-out stages: transform, filter and throttle.
//!
//! A transform never waits on its error channel: when that channel is full
//! the error is logged and dropped so the data path keeps moving.
//!
//! On cancellation these stop reading input at once; values still buffered
//! upstream are left unprocessed. A user function that is already running is
//! never interrupted; the token is observed at the next channel operation.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::channel::{Receiver, Sender, TrySendError};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimiter;
use crate::telemetry;

use super::{emit, ErrorPolicy, Flow};

pub(crate) async fn transform<T, U, E, F>(
    input: Receiver<T>,
    mut f: F,
    policy: ErrorPolicy,
    tx: Sender<U>,
    errors: Sender<Error>,
    token: CancelToken,
) -> Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(T) -> std::result::Result<U, E>,
{
    tracing::debug!(?policy, "transform started");
    let mut failure = None;

    while let Ok(Some(value)) = input.recv(&token).await {
        match f(value) {
            Ok(output) => {
                if let Flow::Stop = emit(&tx, output, &token, "transform").await {
                    break;
                }
            }
            Err(err) => {
                let err = Error::operation(err);
                tracing::warn!(error = %err, ?policy, "transform function failed");
                match policy {
                    ErrorPolicy::Propagate => match errors.try_send(err) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!("error channel full, dropping error");
                            telemetry::error_dropped();
                        }
                        Err(_) => tracing::trace!("nobody reads errors"),
                    },
                    ErrorPolicy::FailFast => {
                        let _ = errors.try_send(err.clone());
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
    }

    tx.close()?;
    errors.close()?;
    tracing::debug!(cancelled = token.is_cancelled(), "transform finished");
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub(crate) async fn filter<T, P>(
    input: Receiver<T>,
    mut predicate: P,
    tx: Sender<T>,
    token: CancelToken,
) -> Result<()>
where
    P: FnMut(&T) -> bool,
{
    tracing::debug!("filter started");
    while let Ok(Some(value)) = input.recv(&token).await {
        if !predicate(&value) {
            tracing::trace!("filter dropped value");
            continue;
        }
        if let Flow::Stop = emit(&tx, value, &token, "filter").await {
            break;
        }
    }
    tx.close()?;
    tracing::debug!(cancelled = token.is_cancelled(), "filter finished");
    Ok(())
}

pub(crate) async fn throttle<T>(
    input: Receiver<T>,
    limiter: Arc<RateLimiter>,
    tx: Sender<T>,
    token: CancelToken,
) -> Result<()> {
    tracing::debug!(
        rate = limiter.rate(),
        burst = limiter.capacity(),
        "throttle started"
    );
    while let Ok(Some(value)) = input.recv(&token).await {
        if limiter.wait(1.0, &token).await.is_err() {
            break;
        }
        if let Flow::Stop = emit(&tx, value, &token, "throttle").await {
            break;
        }
    }
    tx.close()?;
    tracing::debug!(cancelled = token.is_cancelled(), "throttle finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::{collect, filter, generate, throttle, transform, ErrorPolicy};
    use crate::cancel::CancelToken;
    use crate::channel::bounded;
    use crate::error::Error;
    use crate::rate_limit::RateLimiter;

    #[derive(Debug, thiserror::Error)]
    #[error("cannot halve odd number {0}")]
    struct OddNumber(u32);

    fn halve(x: u32) -> Result<u32, OddNumber> {
        if x % 2 == 0 {
            Ok(x / 2)
        } else {
            Err(OddNumber(x))
        }
    }

    #[tokio::test]
    async fn test_filter_then_transform() {
        let token = CancelToken::new();
        let numbers = generate(0..10, 2, &token);
        let evens = filter(numbers, |x: &i32| x % 2 == 0, 2, &token);
        let squares = transform(
            evens,
            |x: i32| Ok::<_, Infallible>(x * x),
            ErrorPolicy::Propagate,
            2,
            &token,
        );
        let collected = collect(squares.output, &token).await;
        assert_eq!(collected.items, vec![0, 4, 16, 36, 64]);
    }

    #[tokio::test]
    async fn test_propagate_policy_reports_errors_and_continues() {
        let token = CancelToken::new();
        let numbers = generate(vec![2u32, 3, 4, 5, 6], 8, &token);
        let halves = transform(numbers, halve, ErrorPolicy::Propagate, 8, &token);

        let values = collect(halves.output, &token).await;
        let errors = collect(halves.errors, &token).await;
        assert_eq!(values.items, vec![1, 2, 3]);
        assert_eq!(errors.items.len(), 2);
        assert!(errors.items.iter().all(Error::is_operation));
        assert_eq!(errors.items[0].to_string(), "operation failed: cannot halve odd number 3");
    }

    #[tokio::test]
    async fn test_fail_fast_policy_stops_stage() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(8);
        for x in [2u32, 4, 5, 6, 8] {
            tx.try_send(x).unwrap();
        }
        tx.close().unwrap();

        let (out_tx, out_rx) = bounded(8);
        let (err_tx, err_rx) = bounded(8);
        let result = super::transform(
            rx,
            halve,
            ErrorPolicy::FailFast,
            out_tx,
            err_tx,
            token.clone(),
        )
        .await;

        assert!(matches!(result, Err(Error::Operation(_))));
        assert_eq!(collect(out_rx, &token).await.items, vec![1, 2]);
        assert_eq!(collect(err_rx, &token).await.items.len(), 1);
    }

    #[tokio::test]
    async fn test_unread_errors_do_not_stall_transform() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(8);
        for x in [2u32, 3, 5, 7, 4] {
            tx.try_send(x).unwrap();
        }
        tx.close().unwrap();

        let (out_tx, out_rx) = bounded(8);
        let (err_tx, err_rx) = bounded(1);
        let stage = super::transform(
            rx,
            halve,
            ErrorPolicy::Propagate,
            out_tx,
            err_tx,
            token.clone(),
        );
        tokio::time::timeout(Duration::from_secs(1), stage)
            .await
            .expect("stage finishes with a full error channel")
            .unwrap();

        assert_eq!(collect(out_rx, &token).await.items, vec![1, 2]);
        // Only the first error fitted; the rest were dropped.
        let errors = collect(err_rx, &token).await.items;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "operation failed: cannot halve odd number 3");
    }

    #[tokio::test]
    async fn test_transform_stops_consuming_on_cancel() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(16);
        for x in 0..10u32 {
            tx.try_send(x).unwrap();
        }
        let stage_token = token.derive();
        stage_token.cancel();

        let (out_tx, out_rx) = bounded(16);
        let (err_tx, _err_rx) = bounded(1);
        super::transform(
            rx.clone(),
            |x: u32| Ok::<_, Infallible>(x),
            ErrorPolicy::Propagate,
            out_tx,
            err_tx,
            stage_token,
        )
        .await
        .unwrap();

        // Buffered input is left unprocessed and the output is closed.
        assert_eq!(rx.len(), 10);
        assert_eq!(out_rx.recv(&token).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_paces_values() {
        let token = CancelToken::new();
        let limiter = Arc::new(RateLimiter::new(2.0, 20.0).unwrap());
        let start = tokio::time::Instant::now();

        let values = generate(0..6, 8, &token);
        let paced = throttle(values, limiter, 8, &token);
        let collected = collect(paced, &token).await;

        assert_eq!(collected.items, vec![0, 1, 2, 3, 4, 5]);
        // Two values pass on the initial burst, four more at 50ms each.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
