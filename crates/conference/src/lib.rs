//! Client side of the conferencing cluster.
//!
//! The worker joins a room as a hidden, non-publishing subscriber and
//! receives typed [`RoomEvent`]s plus per-track audio frames. Everything
//! the cluster emits is drained by the owner through channels; no user
//! code runs inside the transport task.

pub mod call_end;
pub mod signaling;
pub mod token;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use roomscribe_db::ConferenceServer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use call_end::{CallEnd, CallEndDetector};
pub use signaling::SignalingBackend;

#[derive(Debug, thiserror::Error)]
pub enum ConferenceError {
    #[error("failed to connect to conferencing server: {0}")]
    Connect(String),
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("token minting failed: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// One audio frame pulled off a subscribed track.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Room events, in the order the cluster reported them.
#[derive(Debug)]
pub enum RoomEvent {
    ParticipantJoined {
        identity: String,
        connection_type: Option<String>,
        metadata: serde_json::Value,
    },
    ParticipantLeft {
        identity: String,
    },
    /// An audio track became readable; frames arrive on the receiver until
    /// the publisher stops or the room disconnects.
    TrackSubscribed {
        identity: String,
        track_id: String,
        frames: mpsc::Receiver<AudioFrame>,
    },
    Disconnected {
        reason: String,
    },
}

/// Seam between the worker and the conferencing transport, so tests can
/// drive a room from a script.
#[async_trait]
pub trait ConferenceBackend: Send + Sync + 'static {
    async fn join(
        &self,
        server: &ConferenceServer,
        room_name: &str,
        worker_id: Uuid,
    ) -> Result<RoomHandle, ConferenceError>;
}

/// A live room membership. Dropping the handle (or calling `disconnect`)
/// tears down the transport task.
pub struct RoomHandle {
    events: mpsc::Receiver<RoomEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl RoomHandle {
    pub fn new(
        events: mpsc::Receiver<RoomEvent>,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            events,
            connected,
            shutdown,
        }
    }

    /// Next room event; `None` once the transport task has exited.
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Identity the worker joins under. Recognizable so its own session never
/// counts as a participant.
pub fn worker_identity(worker_id: Uuid) -> String {
    format!("worker-{worker_id}")
}

/// Metadata tag carried by worker sessions.
pub fn worker_metadata() -> serde_json::Value {
    serde_json::json!({ "worker": "true", "hidden": "true" })
}

/// True when a participant's metadata marks it as one of our own hidden
/// worker sessions.
pub fn is_hidden_worker(metadata: &serde_json::Value) -> bool {
    metadata.get("worker").and_then(|v| v.as_str()) == Some("true")
}
