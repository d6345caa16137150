//! Fan-out (tee) and fan-in (merge) stages.

use tokio::task::JoinSet;
use tracing::Instrument;

use crate::cancel::CancelToken;
use crate::channel::{Receiver, SendError, Sender};
use crate::error::Result;
use crate::telemetry;

use super::{emit, Flow};

/// Deliver every input value to each live output, in output order, before
/// reading the next one. A slow consumer therefore stalls the tee and, through
/// it, the producer upstream.
pub(crate) async fn tee<T: Clone>(
    input: Receiver<T>,
    outputs: Vec<Sender<T>>,
    token: CancelToken,
) -> Result<()> {
    tracing::debug!(fanout = outputs.len(), "tee started");
    let mut outputs: Vec<Option<Sender<T>>> = outputs.into_iter().map(Some).collect();

    'read: while let Ok(Some(value)) = input.recv(&token).await {
        for slot in outputs.iter_mut() {
            let Some(tx) = slot else { continue };
            let sent = tx.send(value.clone(), &token).await;
            match sent {
                Ok(()) => telemetry::stage_item("tee"),
                Err(SendError::Disconnected(_)) => {
                    tracing::debug!("tee output dropped, pruning it");
                    if let Some(tx) = slot.take() {
                        tx.close()?;
                    }
                }
                Err(_) => break 'read,
            }
        }
        if outputs.iter().all(Option::is_none) {
            tracing::debug!("every tee output dropped");
            break;
        }
    }

    for tx in outputs.into_iter().flatten() {
        tx.close()?;
    }
    tracing::debug!(cancelled = token.is_cancelled(), "tee finished");
    Ok(())
}

/// Forward each input concurrently into `tx`; close it once all forwarders
/// have finished.
pub(crate) async fn merge<T: Send + 'static>(
    inputs: Vec<Receiver<T>>,
    tx: Sender<T>,
    token: CancelToken,
) -> Result<()> {
    tracing::debug!(inputs = inputs.len(), "merge started");
    let mut forwarders = JoinSet::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let tx = tx.clone();
        let token = token.clone();
        forwarders.spawn(
            async move {
                while let Ok(Some(value)) = input.recv(&token).await {
                    if let Flow::Stop = emit(&tx, value, &token, "merge").await {
                        break;
                    }
                }
            }
            .instrument(tracing::trace_span!("merge_input", index)),
        );
    }

    while let Some(joined) = forwarders.join_next().await {
        joined?;
    }
    tx.close()?;
    tracing::debug!(cancelled = token.is_cancelled(), "merge finished");
    Ok(())
}
