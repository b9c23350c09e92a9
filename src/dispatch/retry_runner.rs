use crate::retry::{jitter_between, RetryBackoff, RetrySettings};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Receive side of a subscription driven by [`run_retry_loop`].
#[async_trait]
pub trait RetryContext {
    type Item;
    type Error;

    async fn poll(&mut self) -> Result<Option<Self::Item>, Self::Error>;
    async fn handle_item(&mut self, item: Self::Item);
    async fn report_error(&mut self, error: &Self::Error, delay: Duration);
}

/// Polls `context` until `shutdown` fires.
///
/// Items are handled to completion before the token is checked again, so
/// a message that started processing is never abandoned halfway. Poll
/// errors back off exponentially with a little jitter; the first
/// successful poll resets the backoff.
pub async fn run_retry_loop<C>(
    shutdown: CancellationToken,
    settings: RetrySettings,
    idle_delay: Duration,
    context: &mut C,
) where
    C: RetryContext + Send,
{
    let mut backoff = RetryBackoff::new(settings);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = context.poll() => match result {
                Ok(Some(item)) => {
                    backoff.on_success();
                    context.handle_item(item).await;
                }
                Ok(None) => {
                    if sleep_with_shutdown(idle_delay, &shutdown).await {
                        break;
                    }
                }
                Err(err) => {
                    let base = backoff.on_failure();
                    let delay = jitter_between(base, base + base / 10);
                    context.report_error(&err, delay).await;
                    if sleep_with_shutdown(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }
    }
}

/// Sleeps for `duration` unless `shutdown` fires first. Returns `true` if
/// shutdown occurred during the wait.
pub async fn sleep_with_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = sleep(duration) => false,
    }
}
