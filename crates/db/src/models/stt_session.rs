use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "stt_session_status", rename_all = "snake_case")]
pub enum SttSessionStatus {
    Active,
    Completed,
    Failed,
}

/// One provider stream for one participant track. A participant may open
/// several sessions over a room's lifetime (reconnects) but at most one
/// is `active` at a time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SttSession {
    pub id: Uuid,
    pub room_id: Uuid,
    pub participant_id: Uuid,
    /// Session id reported by the external provider, when it sends one.
    pub external_session_tag: Option<String>,
    pub status: SttSessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub audio_minutes: f64,
    pub transcript_count: i32,
    pub average_confidence: f64,
    pub error_message: Option<String>,
}

impl SttSession {
    pub const TABLE: &'static str = "stt_sessions";
}
