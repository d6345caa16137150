//! Source stages: values entering a pipeline.

use crate::cancel::CancelToken;
use crate::channel::Sender;
use crate::error::Result;

use super::{emit, Flow};

pub(crate) async fn generate<I>(values: I, tx: Sender<I::Item>, token: CancelToken) -> Result<()>
where
    I: Iterator,
{
    tracing::debug!("generate started");
    let mut emitted = 0usize;
    for value in values {
        if let Flow::Stop = emit(&tx, value, &token, "generate").await {
            break;
        }
        emitted += 1;
    }
    tx.close()?;
    tracing::debug!(emitted, cancelled = token.is_cancelled(), "generate finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{collect, generate};
    use crate::cancel::CancelToken;
    use crate::channel::bounded;

    #[tokio::test]
    async fn test_generate_emits_in_order() {
        let token = CancelToken::new();
        let rx = generate(vec!["a", "b", "c"], 1, &token);
        let collected = collect(rx, &token).await;
        assert_eq!(collected.items, vec!["a", "b", "c"]);
        assert!(collected.is_complete());
    }

    #[tokio::test]
    async fn test_generate_empty_closes_immediately() {
        let token = CancelToken::new();
        let rx = generate(Vec::<u8>::new(), 0, &token);
        assert_eq!(rx.recv(&token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_generate_stops_on_cancel_and_closes() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(0);
        let stage_token = token.derive();
        let task = tokio::spawn(super::generate(0.., tx, stage_token.clone()));

        assert_eq!(rx.recv(&token).await.unwrap(), Some(0));
        assert_eq!(rx.recv(&token).await.unwrap(), Some(1));
        stage_token.cancel();

        task.await.unwrap().unwrap();
        assert!(rx.is_closed());
    }
}
