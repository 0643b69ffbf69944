use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DiscoveryContext, DiscoveryMethod};

/// Per-row change events from the store's realtime service.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RealtimeFrame {
    Subscribed,
    Heartbeat,
    Change {
        #[serde(rename = "type")]
        kind: ChangeKind,
        record: serde_json::Value,
        #[serde(default)]
        old_record: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Subscribes to room-table change events; reconnects after the retry
/// interval whenever the subscription closes, errors, or times out.
pub(crate) async fn run(
    ctx: Arc<DiscoveryContext>,
    url: String,
    service_key: String,
    connect_timeout: Duration,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    info!(%url, "Realtime change stream starting");
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = subscribe_and_stream(&ctx, &url, &service_key, connect_timeout) => outcome,
        };

        if let Err(e) = outcome {
            warn!(error = %e, retry_ms = retry_interval.as_millis() as u64, "Realtime stream lost, will reconnect");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
    debug!("Realtime notifier stopped");
}

async fn subscribe_and_stream(
    ctx: &DiscoveryContext,
    url: &str,
    service_key: &str,
    connect_timeout: Duration,
) -> Result<(), String> {
    let endpoint = format!("{url}?apikey={service_key}");
    let connect = tokio_tungstenite::connect_async(&endpoint);
    let (mut ws, _) = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| "realtime subscription timed out".to_string())?
        .map_err(|e| e.to_string())?;

    let subscribe = serde_json::json!({ "event": "subscribe", "table": "rooms" });
    ws.send(Message::text(subscribe.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    let mut last_event = Instant::now();
    info!("Realtime change stream subscribed");

    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| e.to_string())?;
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err("realtime subscription closed".to_string()),
            _ => continue,
        };

        last_event = Instant::now();
        let frame = match serde_json::from_str::<RealtimeFrame>(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Ignoring unknown realtime frame");
                continue;
            }
        };

        match frame {
            RealtimeFrame::Subscribed | RealtimeFrame::Heartbeat => {
                debug!(
                    idle_ms = last_event.elapsed().as_millis() as u64,
                    "Realtime stream healthy"
                );
            }
            RealtimeFrame::Change {
                kind,
                record,
                old_record,
            } => handle_change(ctx, kind, record, old_record).await,
        }
    }

    Err("realtime stream ended".to_string())
}

async fn handle_change(
    ctx: &DiscoveryContext,
    kind: ChangeKind,
    record: serde_json::Value,
    old_record: Option<serde_json::Value>,
) {
    let Some(room_id) = record
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        debug!("Change event without a room id, skipping");
        return;
    };

    let new_status = record.get("status").and_then(|v| v.as_str());
    let old_status = old_record
        .as_ref()
        .and_then(|old| old.get("status"))
        .and_then(|v| v.as_str());

    // Inserts are always worth an attempt; updates only on the
    // became-active transition.
    let claimable = match kind {
        ChangeKind::Insert => true,
        ChangeKind::Update => new_status == Some("active") && old_status != Some("active"),
        ChangeKind::Delete => false,
    };
    if !claimable {
        return;
    }

    let transcription_enabled = record.get("transcription_enabled").and_then(|v| v.as_bool());
    ctx.try_claim(room_id, transcription_enabled, DiscoveryMethod::Realtime)
        .await;
}
