use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use roomscribe_db::ConferenceServer;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    token::mint_join_token, worker_identity, AudioFrame, ConferenceBackend, ConferenceError,
    RoomEvent, RoomHandle,
};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 64;
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Websocket signaling/media client for the conferencing cluster.
///
/// Text frames carry JSON control events tagged by `event`; binary frames
/// carry one audio frame each: a length-prefixed track id followed by
/// little-endian 16-bit PCM samples.
pub struct SignalingBackend;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServerFrame {
    Joined,
    ParticipantJoined {
        identity: String,
        #[serde(default)]
        connection_type: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    ParticipantLeft {
        identity: String,
    },
    TrackSubscribed {
        identity: String,
        track_id: String,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
    },
    TrackEnded {
        track_id: String,
    },
    Error {
        reason: String,
    },
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u16 {
    1
}

struct TrackLane {
    identity: String,
    sender: mpsc::Sender<AudioFrame>,
    sample_rate: u32,
    channels: u16,
}

#[async_trait]
impl ConferenceBackend for SignalingBackend {
    async fn join(
        &self,
        server: &ConferenceServer,
        room_name: &str,
        worker_id: Uuid,
    ) -> Result<RoomHandle, ConferenceError> {
        let identity = worker_identity(worker_id);
        let token = mint_join_token(server, room_name, &identity)?;

        let url = format!("{}/rtc", server.url.trim_end_matches('/'));
        let (mut ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ConferenceError::Connect(e.to_string()))?;

        let join = serde_json::json!({
            "event": "join",
            "room": room_name,
            "token": token,
            "identity": identity,
            "subscribe": true,
            "publish": false,
            "audio_only": true,
            "preferred_sample_rate": 16_000,
            "preferred_channels": 1,
        });
        ws.send(Message::text(join.to_string()))
            .await
            .map_err(|e| ConferenceError::Connect(e.to_string()))?;

        // The cluster acks the join before any room traffic.
        let ack = tokio::time::timeout(JOIN_TIMEOUT, ws.next())
            .await
            .map_err(|_| ConferenceError::JoinRejected("join ack timed out".into()))?;
        match ack {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Joined) => {}
                Ok(ServerFrame::Error { reason }) => {
                    return Err(ConferenceError::JoinRejected(reason));
                }
                other => {
                    return Err(ConferenceError::JoinRejected(format!(
                        "unexpected join ack: {other:?}"
                    )));
                }
            },
            other => {
                return Err(ConferenceError::JoinRejected(format!(
                    "unexpected join ack frame: {other:?}"
                )));
            }
        }

        info!(room = %room_name, %identity, "Joined room as hidden subscriber");

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        tokio::spawn(io_loop(
            ws,
            event_tx,
            Arc::clone(&connected),
            shutdown.clone(),
        ));

        Ok(RoomHandle::new(event_rx, connected, shutdown))
    }
}

async fn io_loop(
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    event_tx: mpsc::Sender<RoomEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut tracks: HashMap<String, TrackLane> = HashMap::new();
    let mut disconnect_reason = "stream ended".to_string();

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws.send(Message::Close(None)).await;
                disconnect_reason = "local disconnect".to_string();
                break;
            }
            message = ws.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "Ignoring unknown signaling frame");
                        continue;
                    }
                };
                if !handle_control(frame, &mut tracks, &event_tx).await {
                    disconnect_reason = "server error".to_string();
                    break;
                }
            }
            Some(Ok(Message::Binary(payload))) => {
                route_audio(&payload, &mut tracks);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                disconnect_reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "closed by server".to_string());
                break;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                disconnect_reason = e.to_string();
                break;
            }
            None => break,
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the lanes closes every per-track frame channel.
    tracks.clear();
    let _ = event_tx
        .send(RoomEvent::Disconnected {
            reason: disconnect_reason,
        })
        .await;
}

/// Returns `false` when the room loop should stop.
async fn handle_control(
    frame: ServerFrame,
    tracks: &mut HashMap<String, TrackLane>,
    event_tx: &mpsc::Sender<RoomEvent>,
) -> bool {
    match frame {
        ServerFrame::Joined => true,
        ServerFrame::ParticipantJoined {
            identity,
            connection_type,
            metadata,
        } => event_tx
            .send(RoomEvent::ParticipantJoined {
                identity,
                connection_type,
                metadata,
            })
            .await
            .is_ok(),
        ServerFrame::ParticipantLeft { identity } => {
            tracks.retain(|_, lane| lane.identity != identity);
            event_tx
                .send(RoomEvent::ParticipantLeft { identity })
                .await
                .is_ok()
        }
        ServerFrame::TrackSubscribed {
            identity,
            track_id,
            sample_rate,
            channels,
        } => {
            let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
            tracks.insert(
                track_id.clone(),
                TrackLane {
                    identity: identity.clone(),
                    sender: frame_tx,
                    sample_rate,
                    channels,
                },
            );
            event_tx
                .send(RoomEvent::TrackSubscribed {
                    identity,
                    track_id,
                    frames: frame_rx,
                })
                .await
                .is_ok()
        }
        ServerFrame::TrackEnded { track_id } => {
            tracks.remove(&track_id);
            true
        }
        ServerFrame::Error { reason } => {
            warn!(%reason, "Conferencing server reported an error");
            false
        }
    }
}

/// Binary layout: `[id_len: u8][track_id bytes][i16 LE samples...]`.
fn route_audio(payload: &[u8], tracks: &mut HashMap<String, TrackLane>) {
    let Some((&id_len, rest)) = payload.split_first() else {
        return;
    };
    let id_len = id_len as usize;
    if rest.len() < id_len {
        debug!("Truncated audio frame, skipping");
        return;
    }
    let (id_bytes, pcm) = rest.split_at(id_len);
    let Ok(track_id) = std::str::from_utf8(id_bytes) else {
        debug!("Non-utf8 track id in audio frame, skipping");
        return;
    };

    let Some(lane) = tracks.get(track_id) else {
        // Frames can race the track_subscribed control frame; drop quietly.
        return;
    };

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    let frame = AudioFrame {
        samples,
        sample_rate: lane.sample_rate,
        channels: lane.channels,
    };

    // A slow consumer sheds frames rather than stalling the whole room.
    if lane.sender.try_send(frame).is_err() {
        debug!(%track_id, "Audio frame dropped, consumer behind");
    }
}
