use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub id: Uuid,
    pub room_id: Uuid,
    /// Unique within a room; reconnects upsert the same row.
    pub identity: String,
    pub connection_type: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub metadata: serde_json::Value,
}

impl Participant {
    pub const TABLE: &'static str = "participants";
}
