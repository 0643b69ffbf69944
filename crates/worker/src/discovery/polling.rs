use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{stale_threshold, DiscoveryContext, DiscoveryMethod};

/// Interval poller: fetches the oldest claimable room and attempts a
/// claim. `poll_now` short-circuits the wait after a release.
pub(crate) async fn run(
    ctx: Arc<DiscoveryContext>,
    interval: Duration,
    poll_now: Arc<Notify>,
    cancel: CancellationToken,
) {
    debug!(interval_ms = interval.as_millis() as u64, "Polling notifier started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll_now.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        poll_once(&ctx, DiscoveryMethod::Polling).await;
    }
    debug!("Polling notifier stopped");
}

/// Single sweep; also used for the startup pass.
pub(crate) async fn poll_once(ctx: &DiscoveryContext, method: DiscoveryMethod) {
    match ctx.store.oldest_claimable_room(stale_threshold()).await {
        Ok(Some(room)) => {
            ctx.try_claim(room.id, Some(room.transcription_enabled), method)
                .await;
        }
        Ok(None) => {}
        Err(e) => {
            // Transient store trouble: the next tick retries.
            warn!(error = %e, "Claimable-room poll failed");
        }
    }
}
