//! Basic usage examples for conflux
//!
//! Run with: cargo run --example basic
//! Set RUST_LOG=conflux=debug to watch stages start and stop.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use conflux::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Example 1: Filter and transform
async fn filter_transform_example() -> Result<()> {
    println!("=== Filter and Transform ===");

    let pipeline = Pipeline::new(PipelineConfig::default().channel_capacity(2))?;
    let numbers = pipeline.generate(0..10);
    let evens = pipeline.filter(numbers, |x: &i32| x % 2 == 0);
    let squares = pipeline.transform(evens, |x: i32| Ok::<_, Infallible>(x * x));

    let completion = pipeline.run(squares.output).await?;
    println!("Squares of evens: {:?}", completion.items);
    println!();
    Ok(())
}

/// Example 2: Fan out to two consumers and back in
async fn tee_merge_example() -> Result<()> {
    println!("=== Tee and Merge ===");

    let pipeline = Pipeline::new(PipelineConfig::default())?;
    let words = pipeline.generate(vec!["tokio", "channel", "pool", "stage"]);
    let mut branches = pipeline.tee(words, 2)?;
    let right = branches.pop().expect("two branches");
    let left = branches.pop().expect("two branches");

    let upper = pipeline.transform(left, |w: &str| Ok::<_, Infallible>(w.to_uppercase()));
    let lengths = pipeline.transform(right, |w: &str| Ok::<_, Infallible>(format!("{w}:{}", w.len())));
    let merged = pipeline.merge(vec![upper.output, lengths.output]);

    let completion = pipeline.run(merged).await?;
    for item in completion.items {
        println!("  {item}");
    }
    println!();
    Ok(())
}

/// Example 3: A rate-limited worker pool
async fn worker_pool_example() -> Result<()> {
    println!("=== Rate-Limited Worker Pool ===");

    let limiter = Arc::new(RateLimiter::new(4.0, 20.0)?);
    let config = PoolConfig::default()
        .workers(3)
        .ordering(ResultOrdering::Submission);
    let mut pool = WorkerPool::rate_limited(
        config,
        |x: u64| async move {
            tokio::time::sleep(Duration::from_millis(10 * (x % 3))).await;
            Ok::<_, Infallible>(x * x)
        },
        limiter,
        CancelToken::new(),
    )?;
    let mut results = pool.results().expect("fresh pool");

    for x in 0..12 {
        pool.submit(x).await?;
    }
    pool.shutdown();

    while let Some(result) = results.next().await {
        println!("  {} -> {:?}", result.id, result.result);
    }
    let summary = pool.join().await;
    println!("Completed {} jobs, {} failed", summary.completed, summary.failed);
    println!();
    Ok(())
}

/// Example 4: Stopping a pipeline that would otherwise run forever
async fn cancellation_example() -> Result<()> {
    println!("=== Cancellation ===");

    let pipeline = Pipeline::new(PipelineConfig::default().channel_capacity(1))?;
    let handle = pipeline.handle();
    let ticks = pipeline.generate(0u64..);
    let limiter = Arc::new(RateLimiter::new(1.0, 50.0)?);
    let paced = pipeline.throttle(ticks, limiter);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop(CancelCause::reason("demo finished")).await;
    });

    let completion = pipeline.run(paced).await?;
    println!(
        "Collected {} ticks before stop ({})",
        completion.items.len(),
        completion
            .cancelled
            .map(|cause| cause.to_string())
            .unwrap_or_else(|| "not cancelled".to_string())
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conflux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    filter_transform_example().await?;
    tee_merge_example().await?;
    worker_pool_example().await?;
    cancellation_example().await?;
    Ok(())
}
