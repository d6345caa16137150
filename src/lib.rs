//! # Cancellable concurrent pipelines for Tokio
//!
//! `conflux` provides the pieces for building bounded, cancellable dataflow
//! pipelines on top of Tokio.
//!
//! ## Core Concepts
//!
//! - **CancelToken**: hierarchical cancellation with causes and deadlines
//! - **Channel**: a bounded multi-producer, multi-consumer channel whose
//!   blocking operations observe a token
//! - **RateLimiter**: a token bucket with blocking or rejecting admission
//! - **WorkerPool**: a fixed set of workers running an operation over a
//!   bounded job queue
//! - **Stages**: generate, transform, filter, tee, merge, throttle, collect
//! - **Pipeline**: wires stages together and owns their tasks
//!
//! ## Example
//!
//! ```rust
//! use std::convert::Infallible;
//! use conflux::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pipeline = Pipeline::new(PipelineConfig::default())?;
//!     let words = pipeline.generate(vec!["alpha", "beta", "gamma"]);
//!     let lengths = pipeline.transform(words, |w: &str| Ok::<_, Infallible>(w.len()));
//!
//!     let completion = pipeline.run(lengths.output).await?;
//!     assert_eq!(completion.items, vec![5, 4, 5]);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod channel;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod stages;

mod telemetry;

// Re-export commonly used items
pub mod prelude {
    pub use crate::cancel::{CancelCause, CancelToken, CancellableExt};
    pub use crate::channel::{bounded, Receiver, Sender};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{Pipeline, PipelineConfig, PipelineHandle};
    pub use crate::pool::{JobId, JobResult, Operation, PoolConfig, ResultOrdering, WorkerPool};
    pub use crate::rate_limit::{AdmissionPolicy, RateLimiter, RateLimiterConfig};
    pub use crate::stages::{Collected, ErrorPolicy, Transformed};
}

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
