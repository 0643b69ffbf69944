use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "worker_mode", rename_all = "kebab-case")]
pub enum WorkerMode {
    Transcription,
    AiJobs,
    Both,
}

impl WorkerMode {
    pub fn runs_transcription(&self) -> bool {
        matches!(self, WorkerMode::Transcription | WorkerMode::Both)
    }

    pub fn runs_ai_jobs(&self) -> bool {
        matches!(self, WorkerMode::AiJobs | WorkerMode::Both)
    }

    /// Whether this worker should claim a room with the given transcription flag.
    ///
    /// `transcription` claims transcription-enabled rooms, `ai-jobs` the rest,
    /// `both` claims everything.
    pub fn accepts_room(&self, transcription_enabled: bool) -> bool {
        match self {
            WorkerMode::Transcription => transcription_enabled,
            WorkerMode::AiJobs => !transcription_enabled,
            WorkerMode::Both => true,
        }
    }
}

impl std::str::FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcription" => Ok(WorkerMode::Transcription),
            "ai-jobs" => Ok(WorkerMode::AiJobs),
            "both" => Ok(WorkerMode::Both),
            other => Err(format!("unknown worker mode '{other}'")),
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerMode::Transcription => "transcription",
            WorkerMode::AiJobs => "ai-jobs",
            WorkerMode::Both => "both",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "worker_status", rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Worker {
    pub id: Uuid,
    pub mode: WorkerMode,
    pub status: WorkerStatus,
    pub current_room_id: Option<Uuid>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl Worker {
    pub const TABLE: &'static str = "workers";
}
