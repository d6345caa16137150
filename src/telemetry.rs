//! Counters recorded by the runtime.
//!
//! With the `metrics` feature enabled these forward to the `metrics` facade;
//! otherwise they compile to nothing.

/// A value passed through a pipeline stage.
#[inline]
pub(crate) fn stage_item(stage: &'static str) {
    #[cfg(feature = "metrics")]
    metrics::counter!("conflux_stage_items_total", "stage" => stage).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = stage;
}

/// A worker pool job finished, successfully or not.
#[inline]
pub(crate) fn job_finished(ok: bool) {
    #[cfg(feature = "metrics")]
    {
        if ok {
            metrics::counter!("conflux_jobs_completed_total").increment(1);
        } else {
            metrics::counter!("conflux_jobs_failed_total").increment(1);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = ok;
}

/// The rate limiter refused admission under the reject policy.
#[inline]
pub(crate) fn rate_limit_rejected() {
    #[cfg(feature = "metrics")]
    metrics::counter!("conflux_rate_limit_rejections_total").increment(1);
}

/// A propagated transform error was dropped because its channel was full.
#[inline]
pub(crate) fn error_dropped() {
    #[cfg(feature = "metrics")]
    metrics::counter!("conflux_dropped_errors_total").increment(1);
}
