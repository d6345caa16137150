//! Terminal stages.

use std::future::Future;

use crate::cancel::CancelToken;
use crate::channel::Receiver;
use crate::error::Error;

use super::Collected;

/// Drain `input` until it is closed, or until `token` fires.
///
/// Cancellation is reported in [`Collected::cancelled`] alongside whatever
/// was collected before it, never as a silently short result.
pub fn collect<T>(
    input: Receiver<T>,
    token: &CancelToken,
) -> impl Future<Output = Collected<T>> + Send + 'static
where
    T: Send + 'static,
{
    let token = token.clone();
    async move {
        let mut items = Vec::new();
        loop {
            match input.recv(&token).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {
                    return Collected {
                        items,
                        cancelled: None,
                    }
                }
                Err(Error::Cancelled(cause)) => {
                    tracing::debug!(collected = items.len(), %cause, "collection cancelled");
                    return Collected {
                        items,
                        cancelled: Some(cause),
                    };
                }
                Err(err) => {
                    // recv only fails through cancellation
                    tracing::warn!(error = %err, "unexpected receive failure");
                    return Collected {
                        items,
                        cancelled: token.cause(),
                    };
                }
            }
        }
    }
}
