use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Post-call analysis work item, consumed by the ai-jobs driver.
///
/// Normally inserted by the conferencing server's completion webhook; the
/// worker inserts a fallback set on finalize when none exists yet.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub room_id: Uuid,
    pub job_type: String,
    pub priority: i32,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub const TABLE: &'static str = "analysis_jobs";

    /// The canonical post-call set inserted by the finalize fallback.
    pub const CANONICAL_SET: [(&'static str, i32); 4] = [
        ("summary", 100),
        ("action_items", 90),
        ("sentiment", 70),
        ("speaker_analytics", 50),
    ];
}
