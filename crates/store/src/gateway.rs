use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomscribe_db::{AnalysisJob, ConferenceServer, Room, SttSessionStatus, WorkerMode};
use uuid::Uuid;

/// Heartbeats older than this make a worker's ownership forfeit.
pub const CLAIM_STALE_AFTER: Duration = Duration::from_secs(45);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Database(#[from] sqlx::Error),
    /// A required configuration row is absent (provider credentials,
    /// conferencing cluster entry). The room iteration should be aborted
    /// and the claim released; retrying the query will not help.
    #[error("missing required configuration row: {0}")]
    MissingConfig(String),
    /// Transient unavailability; retry on the next tick.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A transcript row ready for the batch insert; ids and the relative
/// timestamp are assigned at flush time.
#[derive(Debug, Clone)]
pub struct NewTranscript {
    pub room_id: Uuid,
    pub stt_session_id: Uuid,
    pub participant_id: Uuid,
    pub text: String,
    pub confidence: f64,
    pub relative_timestamp_seconds: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub language: Option<String>,
    pub wall_clock_timestamp: DateTime<Utc>,
    pub organization_id: Option<Uuid>,
}

/// Terminal update for an STT session row.
#[derive(Debug, Clone)]
pub struct SessionClose {
    pub session_id: Uuid,
    pub external_session_tag: Option<String>,
    pub status: SttSessionStatus,
    pub ended_at: DateTime<Utc>,
    pub audio_minutes: f64,
    pub transcript_count: i32,
    pub average_confidence: f64,
    pub error_message: Option<String>,
}

/// Remote-callable surface of the coordination store.
///
/// The four ownership operations (`claim_room`, `update_heartbeat`,
/// `release_room`, `reap_stale_workers`) carry the atomicity contract the
/// whole cluster depends on: `claim_room`'s read-decide-write must be a
/// single conditional update.
#[async_trait]
pub trait StoreGateway: Send + Sync + 'static {
    /// Atomically takes ownership of a claimable room.
    ///
    /// Succeeds only while `status ∈ {pending, active}` and the owner slot
    /// is empty or stale; on success the owner columns, `status =
    /// processing` and a piggybacked worker heartbeat are written. Returns
    /// `true` iff exactly one room row changed.
    async fn claim_room(&self, worker_id: Uuid, room_id: Uuid) -> StoreResult<bool>;

    /// Advertises liveness. `room_id = None` must overwrite
    /// `current_room_id` with null, never keep the previous value.
    async fn update_heartbeat(&self, worker_id: Uuid, room_id: Option<Uuid>) -> StoreResult<()>;

    /// Clears the owner columns iff `worker_id` still owns the room, and
    /// the worker's `current_room_id` iff it equals the room. An
    /// unfinished room (still `processing`) reverts to `pending` so it is
    /// claimable again. Safe to call twice.
    async fn release_room(&self, worker_id: Uuid, room_id: Uuid) -> StoreResult<()>;

    /// Stops workers whose heartbeat is older than `threshold` and frees
    /// any rooms they owned (abandoned `processing` rooms revert to
    /// `pending`), in one transaction. Returns the count reaped.
    async fn reap_stale_workers(&self, threshold: Duration) -> StoreResult<u64>;

    async fn register_worker(&self, worker_id: Uuid, mode: WorkerMode) -> StoreResult<()>;
    async fn mark_worker_stopped(&self, worker_id: Uuid) -> StoreResult<()>;

    async fn get_room(&self, room_id: Uuid) -> StoreResult<Option<Room>>;

    /// Oldest room (by `created_at`) that is claimable right now: status
    /// pending/active and owner empty or stale.
    async fn oldest_claimable_room(&self, threshold: Duration) -> StoreResult<Option<Room>>;

    /// Sets `timebase_origin` only if it is still null and returns the
    /// value stored afterwards, so a losing contender adopts the winner's.
    async fn set_timebase_if_null(
        &self,
        room_id: Uuid,
        origin: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>>;

    /// Marks the room completed. Idempotent: a second call leaves the
    /// original `closed_at` untouched.
    async fn complete_room(&self, room_id: Uuid) -> StoreResult<()>;

    /// Inserts or revives the participant row keyed `(room_id, identity)`
    /// and returns its id.
    async fn upsert_participant(
        &self,
        room_id: Uuid,
        identity: &str,
        connection_type: Option<&str>,
        metadata: serde_json::Value,
    ) -> StoreResult<Uuid>;

    async fn mark_participant_left(&self, room_id: Uuid, identity: &str) -> StoreResult<()>;

    /// Finalize step 3: any participant still active gets `left_at = now`.
    async fn close_room_participants(&self, room_id: Uuid) -> StoreResult<u64>;

    async fn insert_stt_session(&self, room_id: Uuid, participant_id: Uuid) -> StoreResult<Uuid>;
    async fn close_stt_session(&self, close: SessionClose) -> StoreResult<()>;

    /// Batch insert of finalized transcript rows. All-or-nothing: on error
    /// the caller decides whether to requeue.
    async fn insert_transcripts(&self, rows: &[NewTranscript]) -> StoreResult<()>;

    async fn get_conference_server(&self, name: &str) -> StoreResult<Option<ConferenceServer>>;
    async fn get_service_setting(&self, key: &str) -> StoreResult<Option<String>>;

    async fn room_has_jobs(&self, room_id: Uuid) -> StoreResult<bool>;

    /// Inserts the canonical post-call job set with a shared payload.
    async fn insert_fallback_jobs(
        &self,
        room_id: Uuid,
        payload: serde_json::Value,
    ) -> StoreResult<()>;

    /// Claims the highest-priority pending job (oldest first within a
    /// priority) by flipping it to `running` in one conditional update.
    async fn claim_next_job(&self) -> StoreResult<Option<AnalysisJob>>;

    async fn finish_job(
        &self,
        job_id: Uuid,
        outcome: Result<serde_json::Value, String>,
    ) -> StoreResult<()>;

    /// All transcript rows for a room ordered by the room timeline.
    async fn fetch_room_transcripts(
        &self,
        room_id: Uuid,
    ) -> StoreResult<Vec<roomscribe_db::TranscriptRow>>;
}
