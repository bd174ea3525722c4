use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::Result;

/// Sleeps for `duration` unless `token` is cancelled first.
///
/// Returns false when the sleep was cut short by cancellation.
pub(crate) async fn cancellable_sleep(
    duration: Duration,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Spawns a named background task whose error is logged instead of lost.
pub(crate) fn spawn_task<F>(
    name: &str,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    })
}
