use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A finalized utterance on the room timeline.
///
/// `relative_timestamp_seconds` is always
/// `(wall_clock_timestamp - room.timebase_origin)` in seconds, so rows
/// written by successive owners of the same room stay on one axis.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscriptRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub stt_session_id: Uuid,
    pub participant_id: Uuid,
    pub text: String,
    pub is_final: bool,
    pub confidence: f64,
    pub relative_timestamp_seconds: f64,
    /// Provider-reported utterance bounds, seconds from stream start.
    pub start_time: f64,
    pub end_time: f64,
    pub language: Option<String>,
    pub wall_clock_timestamp: DateTime<Utc>,
    pub organization_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

impl TranscriptRow {
    pub const TABLE: &'static str = "transcripts";
}
