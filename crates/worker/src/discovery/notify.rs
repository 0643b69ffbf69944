use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DiscoveryContext, DiscoveryMethod};

const CHANNEL: &str = "room_available";
const RECONNECT_BASE: Duration = Duration::from_secs(5);

/// Payload the store's triggers emit on room insert and on updates that
/// make a room claimable (status back to pending/active, owner cleared).
#[derive(Debug, Deserialize)]
struct RoomAvailablePayload {
    room_id: Uuid,
    #[serde(default)]
    room_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    event: Option<String>,
}

/// Long-lived LISTEN connection on `room_available`. Reconnects with a
/// jittered delay on any listener failure.
pub(crate) async fn run(ctx: Arc<DiscoveryContext>, direct_url: String, cancel: CancellationToken) {
    info!(channel = CHANNEL, "Database notify listener starting");
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = listen(&ctx, &direct_url) => outcome,
        };

        if let Err(e) = outcome {
            warn!(error = %e, "Notify listener dropped, reconnecting");
        }

        let jitter = rand::thread_rng().gen_range(Duration::ZERO..Duration::from_secs(2));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_BASE + jitter) => {}
        }
    }
    debug!("Notify listener stopped");
}

async fn listen(ctx: &DiscoveryContext, direct_url: &str) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect(direct_url).await?;
    listener.listen(CHANNEL).await?;
    info!(channel = CHANNEL, "Listening for room notifications");

    loop {
        let notification = listener.recv().await?;
        let payload: RoomAvailablePayload = match serde_json::from_str(notification.payload()) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, raw = notification.payload(), "Ignoring malformed notification");
                continue;
            }
        };

        debug!(
            room_id = %payload.room_id,
            status = payload.status.as_deref().unwrap_or("-"),
            event = payload.event.as_deref().unwrap_or("-"),
            name = payload.room_name.as_deref().unwrap_or("-"),
            "Room notification received"
        );

        // The payload carries no mode information; try_claim fetches the
        // row before filtering.
        ctx.try_claim(payload.room_id, None, DiscoveryMethod::Notify)
            .await;
    }
}
