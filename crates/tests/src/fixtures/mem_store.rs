//! In-memory [`StoreGateway`] mirroring the Postgres contract, so the
//! ownership laws can be exercised without a database. Every operation
//! holds one lock for its whole read-decide-write, which matches the
//! single-statement atomicity of the real gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomscribe_db::{
    AnalysisJob, ConferenceServer, JobStatus, Participant, Room, RoomStatus, SttSession,
    SttSessionStatus, TranscriptRow, Worker, WorkerMode, WorkerStatus,
};
use roomscribe_store::{NewTranscript, SessionClose, StoreError, StoreGateway, StoreResult};
use uuid::Uuid;

#[derive(Default)]
struct State {
    rooms: HashMap<Uuid, Room>,
    workers: HashMap<Uuid, Worker>,
    participants: Vec<Participant>,
    sessions: HashMap<Uuid, SttSession>,
    transcripts: Vec<TranscriptRow>,
    jobs: Vec<AnalysisJob>,
    servers: HashMap<String, ConferenceServer>,
    settings: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
    /// While set, `insert_transcripts` fails (back-pressure tests).
    fail_transcripts: AtomicBool,
    transcript_insert_attempts: AtomicU32,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Seeding helpers ─────────────────────────────────────────

    pub fn seed_room(&self, name: &str, status: RoomStatus) -> Room {
        let room = Room {
            id: Uuid::new_v4(),
            name: name.to_string(),
            server_ref: "cluster-a".to_string(),
            status,
            ai_enabled: true,
            transcription_enabled: true,
            empty_timeout_seconds: 10,
            organization_id: None,
            owner_worker_id: None,
            owner_claimed_at: None,
            owner_heartbeat_at: None,
            timebase_origin: None,
            created_at: Utc::now(),
            closed_at: None,
        };
        self.lock().rooms.insert(room.id, room.clone());
        room
    }

    pub fn put_room(&self, room: Room) {
        self.lock().rooms.insert(room.id, room);
    }

    pub fn room(&self, room_id: Uuid) -> Option<Room> {
        self.lock().rooms.get(&room_id).cloned()
    }

    pub fn seed_server(&self, name: &str) -> ConferenceServer {
        let server = ConferenceServer {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: "wss://conf.test".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        };
        self.lock().servers.insert(name.to_string(), server.clone());
        server
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        self.lock()
            .settings
            .insert(key.to_string(), value.to_string());
    }

    pub fn worker(&self, worker_id: Uuid) -> Option<Worker> {
        self.lock().workers.get(&worker_id).cloned()
    }

    pub fn set_worker_heartbeat(&self, worker_id: Uuid, at: DateTime<Utc>) {
        if let Some(worker) = self.lock().workers.get_mut(&worker_id) {
            worker.last_heartbeat_at = at;
        }
    }

    pub fn set_room_heartbeat(&self, room_id: Uuid, at: Option<DateTime<Utc>>) {
        if let Some(room) = self.lock().rooms.get_mut(&room_id) {
            room.owner_heartbeat_at = at;
        }
    }

    pub fn participants(&self, room_id: Uuid) -> Vec<Participant> {
        self.lock()
            .participants
            .iter()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn sessions(&self, room_id: Uuid) -> Vec<SttSession> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn transcripts(&self, room_id: Uuid) -> Vec<TranscriptRow> {
        self.lock()
            .transcripts
            .iter()
            .filter(|t| t.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn jobs(&self, room_id: Uuid) -> Vec<AnalysisJob> {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn set_fail_transcripts(&self, fail: bool) {
        self.fail_transcripts.store(fail, Ordering::SeqCst);
    }

    pub fn transcript_insert_attempts(&self) -> u32 {
        self.transcript_insert_attempts.load(Ordering::SeqCst)
    }

    fn stale(at: Option<DateTime<Utc>>, threshold: Duration) -> bool {
        match at {
            None => true,
            Some(at) => {
                Utc::now() - at
                    > chrono::Duration::from_std(threshold)
                        .unwrap_or_else(|_| chrono::Duration::zero())
            }
        }
    }
}

#[async_trait]
impl StoreGateway for MemStore {
    async fn claim_room(&self, worker_id: Uuid, room_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(room) = state.rooms.get_mut(&room_id) else {
            return Ok(false);
        };

        let claimable = room.status.is_claimable()
            && (room.owner_worker_id.is_none()
                || Self::stale(room.owner_heartbeat_at, roomscribe_store::CLAIM_STALE_AFTER));
        if !claimable {
            return Ok(false);
        }

        let now = Utc::now();
        room.owner_worker_id = Some(worker_id);
        room.owner_claimed_at = Some(now);
        room.owner_heartbeat_at = Some(now);
        room.status = RoomStatus::Processing;

        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.current_room_id = Some(room_id);
            worker.last_heartbeat_at = now;
            worker.status = WorkerStatus::Active;
        }
        Ok(true)
    }

    async fn update_heartbeat(&self, worker_id: Uuid, room_id: Option<Uuid>) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.last_heartbeat_at = Utc::now();
            worker.current_room_id = room_id;
            worker.status = WorkerStatus::Active;
        }
        if let Some(room_id) = room_id {
            if let Some(room) = state.rooms.get_mut(&room_id) {
                if room.owner_worker_id == Some(worker_id) {
                    room.owner_heartbeat_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }

    async fn release_room(&self, worker_id: Uuid, room_id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(room) = state.rooms.get_mut(&room_id) {
            if room.owner_worker_id == Some(worker_id) {
                room.owner_worker_id = None;
                room.owner_claimed_at = None;
                room.owner_heartbeat_at = None;
                if room.status == RoomStatus::Processing {
                    room.status = RoomStatus::Pending;
                }
            }
        }
        if let Some(worker) = state.workers.get_mut(&worker_id) {
            if worker.current_room_id == Some(room_id) {
                worker.current_room_id = None;
            }
        }
        Ok(())
    }

    async fn reap_stale_workers(&self, threshold: Duration) -> StoreResult<u64> {
        let mut state = self.lock();
        let stale: Vec<Uuid> = state
            .workers
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Active && Self::stale(Some(w.last_heartbeat_at), threshold)
            })
            .map(|w| w.id)
            .collect();

        for room in state.rooms.values_mut() {
            if let Some(owner) = room.owner_worker_id {
                if stale.contains(&owner) {
                    room.owner_worker_id = None;
                    room.owner_claimed_at = None;
                    room.owner_heartbeat_at = None;
                    if room.status == RoomStatus::Processing {
                        room.status = RoomStatus::Pending;
                    }
                }
            }
        }
        for id in &stale {
            if let Some(worker) = state.workers.get_mut(id) {
                worker.status = WorkerStatus::Stopped;
                worker.current_room_id = None;
            }
        }
        Ok(stale.len() as u64)
    }

    async fn register_worker(&self, worker_id: Uuid, mode: WorkerMode) -> StoreResult<()> {
        let now = Utc::now();
        self.lock().workers.insert(
            worker_id,
            Worker {
                id: worker_id,
                mode,
                status: WorkerStatus::Active,
                current_room_id: None,
                last_heartbeat_at: now,
                started_at: now,
            },
        );
        Ok(())
    }

    async fn mark_worker_stopped(&self, worker_id: Uuid) -> StoreResult<()> {
        if let Some(worker) = self.lock().workers.get_mut(&worker_id) {
            worker.status = WorkerStatus::Stopped;
            worker.current_room_id = None;
        }
        Ok(())
    }

    async fn get_room(&self, room_id: Uuid) -> StoreResult<Option<Room>> {
        Ok(self.lock().rooms.get(&room_id).cloned())
    }

    async fn oldest_claimable_room(&self, threshold: Duration) -> StoreResult<Option<Room>> {
        let state = self.lock();
        let mut candidates: Vec<&Room> = state
            .rooms
            .values()
            .filter(|room| {
                room.status.is_claimable()
                    && (room.owner_worker_id.is_none()
                        || Self::stale(room.owner_heartbeat_at, threshold))
            })
            .collect();
        candidates.sort_by_key(|room| room.created_at);
        Ok(candidates.first().map(|room| (*room).clone()))
    }

    async fn set_timebase_if_null(
        &self,
        room_id: Uuid,
        origin: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let mut state = self.lock();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| StoreError::Unavailable("room not found".into()))?;
        Ok(*room.timebase_origin.get_or_insert(origin))
    }

    async fn complete_room(&self, room_id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(room) = state.rooms.get_mut(&room_id) {
            if !matches!(room.status, RoomStatus::Completed | RoomStatus::Closed) {
                room.status = RoomStatus::Completed;
                room.closed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn upsert_participant(
        &self,
        room_id: Uuid,
        identity: &str,
        connection_type: Option<&str>,
        metadata: serde_json::Value,
    ) -> StoreResult<Uuid> {
        let mut state = self.lock();
        if let Some(existing) = state
            .participants
            .iter_mut()
            .find(|p| p.room_id == room_id && p.identity == identity)
        {
            existing.connection_type = connection_type.map(str::to_string);
            existing.joined_at = Utc::now();
            existing.left_at = None;
            existing.is_active = true;
            existing.metadata = metadata;
            return Ok(existing.id);
        }

        let participant = Participant {
            id: Uuid::new_v4(),
            room_id,
            identity: identity.to_string(),
            connection_type: connection_type.map(str::to_string),
            joined_at: Utc::now(),
            left_at: None,
            is_active: true,
            metadata,
        };
        let id = participant.id;
        state.participants.push(participant);
        Ok(id)
    }

    async fn mark_participant_left(&self, room_id: Uuid, identity: &str) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(participant) = state
            .participants
            .iter_mut()
            .find(|p| p.room_id == room_id && p.identity == identity)
        {
            participant.left_at = Some(Utc::now());
            participant.is_active = false;
        }
        Ok(())
    }

    async fn close_room_participants(&self, room_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock();
        let mut closed = 0;
        for participant in state
            .participants
            .iter_mut()
            .filter(|p| p.room_id == room_id && p.is_active)
        {
            participant.left_at = Some(Utc::now());
            participant.is_active = false;
            closed += 1;
        }
        Ok(closed)
    }

    async fn insert_stt_session(&self, room_id: Uuid, participant_id: Uuid) -> StoreResult<Uuid> {
        let session = SttSession {
            id: Uuid::new_v4(),
            room_id,
            participant_id,
            external_session_tag: None,
            status: SttSessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            audio_minutes: 0.0,
            transcript_count: 0,
            average_confidence: 0.0,
            error_message: None,
        };
        let id = session.id;
        self.lock().sessions.insert(id, session);
        Ok(id)
    }

    async fn close_stt_session(&self, close: SessionClose) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(&close.session_id) {
            session.status = close.status;
            session.ended_at = Some(close.ended_at);
            session.audio_minutes = close.audio_minutes;
            session.transcript_count = close.transcript_count;
            session.average_confidence = close.average_confidence;
            session.error_message = close.error_message;
            if close.external_session_tag.is_some() {
                session.external_session_tag = close.external_session_tag;
            }
        }
        Ok(())
    }

    async fn insert_transcripts(&self, rows: &[NewTranscript]) -> StoreResult<()> {
        self.transcript_insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_transcripts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("transcript insert stubbed out".into()));
        }

        let mut state = self.lock();
        for row in rows {
            state.transcripts.push(TranscriptRow {
                id: Uuid::new_v4(),
                room_id: row.room_id,
                stt_session_id: row.stt_session_id,
                participant_id: row.participant_id,
                text: row.text.clone(),
                is_final: true,
                confidence: row.confidence,
                relative_timestamp_seconds: row.relative_timestamp_seconds,
                start_time: row.start_time,
                end_time: row.end_time,
                language: row.language.clone(),
                wall_clock_timestamp: row.wall_clock_timestamp,
                organization_id: row.organization_id,
                metadata: serde_json::Value::Object(Default::default()),
            });
        }
        Ok(())
    }

    async fn get_conference_server(&self, name: &str) -> StoreResult<Option<ConferenceServer>> {
        Ok(self.lock().servers.get(name).cloned())
    }

    async fn get_service_setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().settings.get(key).cloned())
    }

    async fn room_has_jobs(&self, room_id: Uuid) -> StoreResult<bool> {
        Ok(self.lock().jobs.iter().any(|j| j.room_id == room_id))
    }

    async fn insert_fallback_jobs(
        &self,
        room_id: Uuid,
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        for (job_type, priority) in AnalysisJob::CANONICAL_SET {
            state.jobs.push(AnalysisJob {
                id: Uuid::new_v4(),
                room_id,
                job_type: job_type.to_string(),
                priority,
                status: JobStatus::Pending,
                payload: payload.clone(),
                result: None,
                error_message: None,
                attempts: 0,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            });
        }
        Ok(())
    }

    async fn claim_next_job(&self) -> StoreResult<Option<AnalysisJob>> {
        let mut state = self.lock();
        let next = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .max_by_key(|j| (j.priority, std::cmp::Reverse(j.created_at)));
        if let Some(job) = next {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.attempts += 1;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        outcome: Result<serde_json::Value, String>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) {
            match outcome {
                Ok(result) => {
                    job.status = JobStatus::Completed;
                    job.result = Some(result);
                }
                Err(message) => {
                    job.status = JobStatus::Failed;
                    job.error_message = Some(message);
                }
            }
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fetch_room_transcripts(&self, room_id: Uuid) -> StoreResult<Vec<TranscriptRow>> {
        let mut rows = self.transcripts(room_id);
        rows.sort_by(|a, b| {
            a.relative_timestamp_seconds
                .partial_cmp(&b.relative_timestamp_seconds)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }
}
