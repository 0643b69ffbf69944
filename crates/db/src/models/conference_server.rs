use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A conferencing cluster the worker can join rooms on. Rooms point at a
/// cluster through `server_ref = name`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConferenceServer {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl ConferenceServer {
    pub const TABLE: &'static str = "conference_servers";
}
