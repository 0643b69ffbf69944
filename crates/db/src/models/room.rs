use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "room_status", rename_all = "snake_case")]
pub enum RoomStatus {
    /// Inserted by the webhook collaborator, waiting for a worker.
    Pending,
    /// Participants joined before any worker claimed it. Still claimable.
    Active,
    /// Owned by a worker.
    Processing,
    Completed,
    Closed,
}

impl RoomStatus {
    pub fn is_claimable(&self) -> bool {
        matches!(self, RoomStatus::Pending | RoomStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    /// Which conferencing cluster hosts this room (key into `conference_servers`).
    pub server_ref: String,
    pub status: RoomStatus,
    pub ai_enabled: bool,
    pub transcription_enabled: bool,
    pub empty_timeout_seconds: i32,
    pub organization_id: Option<Uuid>,
    pub owner_worker_id: Option<Uuid>,
    pub owner_claimed_at: Option<DateTime<Utc>>,
    pub owner_heartbeat_at: Option<DateTime<Utc>>,
    /// Set once by the first owner; successors reuse it.
    pub timebase_origin: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Room {
    pub const TABLE: &'static str = "rooms";
}
