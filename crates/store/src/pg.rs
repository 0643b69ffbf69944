use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roomscribe_db::{AnalysisJob, ConferenceServer, JobStatus, Room, TranscriptRow, WorkerMode};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::gateway::{NewTranscript, SessionClose, StoreError, StoreGateway, StoreResult};

/// Postgres-backed store gateway.
///
/// Every ownership operation is a single conditional statement (or one
/// transaction for the reaper), so concurrent workers race on row counts,
/// never on read-then-write gaps.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreGateway for PgStore {
    async fn claim_room(&self, worker_id: Uuid, room_id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE rooms
               SET owner_worker_id = $1,
                   owner_claimed_at = now(),
                   owner_heartbeat_at = now(),
                   status = 'processing'
             WHERE id = $2
               AND status IN ('pending', 'active')
               AND (owner_worker_id IS NULL
                    OR owner_heartbeat_at IS NULL
                    OR owner_heartbeat_at < now() - make_interval(secs => $3))
            "#,
        )
        .bind(worker_id)
        .bind(room_id)
        .bind(crate::CLAIM_STALE_AFTER.as_secs_f64())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if claimed {
            // Heartbeat piggybacked on the claim, so liveness is causally
            // after ownership for any observer.
            sqlx::query(
                r#"
                UPDATE workers
                   SET current_room_id = $2,
                       last_heartbeat_at = now(),
                       status = 'active'
                 WHERE id = $1
                "#,
            )
            .bind(worker_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn update_heartbeat(&self, worker_id: Uuid, room_id: Option<Uuid>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE workers
               SET last_heartbeat_at = now(),
                   current_room_id = $2,
                   status = 'active'
             WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_room(&self, worker_id: Uuid, room_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE rooms
               SET owner_worker_id = NULL,
                   owner_claimed_at = NULL,
                   owner_heartbeat_at = NULL,
                   status = CASE WHEN status = 'processing'
                                 THEN 'pending'::room_status ELSE status END
             WHERE id = $2 AND owner_worker_id = $1
            "#,
        )
        .bind(worker_id)
        .bind(room_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE workers
               SET current_room_id = NULL
             WHERE id = $1 AND current_room_id = $2
            "#,
        )
        .bind(worker_id)
        .bind(room_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reap_stale_workers(&self, threshold: Duration) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE rooms
               SET owner_worker_id = NULL,
                   owner_claimed_at = NULL,
                   owner_heartbeat_at = NULL,
                   status = CASE WHEN status = 'processing'
                                 THEN 'pending'::room_status ELSE status END
             WHERE owner_worker_id IN (
                   SELECT id FROM workers
                    WHERE status = 'active'
                      AND last_heartbeat_at < now() - make_interval(secs => $1))
            "#,
        )
        .bind(threshold.as_secs_f64())
        .execute(&mut *tx)
        .await?;

        let reaped = sqlx::query(
            r#"
            UPDATE workers
               SET status = 'stopped',
                   current_room_id = NULL
             WHERE status = 'active'
               AND last_heartbeat_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(threshold.as_secs_f64())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(reaped)
    }

    async fn register_worker(&self, worker_id: Uuid, mode: WorkerMode) -> StoreResult<()> {
        // WORKER_ID may be stable across restarts; revive the old row.
        sqlx::query(
            r#"
            INSERT INTO workers (id, mode, status, current_room_id, last_heartbeat_at, started_at)
            VALUES ($1, $2, 'active', NULL, now(), now())
            ON CONFLICT (id) DO UPDATE
               SET mode = EXCLUDED.mode,
                   status = 'active',
                   current_room_id = NULL,
                   last_heartbeat_at = now(),
                   started_at = now()
            "#,
        )
        .bind(worker_id)
        .bind(mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_worker_stopped(&self, worker_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE workers
               SET status = 'stopped',
                   current_room_id = NULL
             WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_room(&self, room_id: Uuid) -> StoreResult<Option<Room>> {
        let room = sqlx::query_as::<_, Room>("SELECT * FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(room)
    }

    async fn oldest_claimable_room(&self, threshold: Duration) -> StoreResult<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            r#"
            SELECT * FROM rooms
             WHERE status IN ('pending', 'active')
               AND (owner_worker_id IS NULL
                    OR owner_heartbeat_at IS NULL
                    OR owner_heartbeat_at < now() - make_interval(secs => $1))
             ORDER BY created_at ASC
             LIMIT 1
            "#,
        )
        .bind(threshold.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    async fn set_timebase_if_null(
        &self,
        room_id: Uuid,
        origin: DateTime<Utc>,
    ) -> StoreResult<DateTime<Utc>> {
        let stored = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE rooms
               SET timebase_origin = COALESCE(timebase_origin, $2)
             WHERE id = $1
            RETURNING timebase_origin
            "#,
        )
        .bind(room_id)
        .bind(origin)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn complete_room(&self, room_id: Uuid) -> StoreResult<()> {
        // Conditioned on status so a second finalize never moves closed_at.
        sqlx::query(
            r#"
            UPDATE rooms
               SET status = 'completed',
                   closed_at = now()
             WHERE id = $1
               AND status NOT IN ('completed', 'closed')
            "#,
        )
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_participant(
        &self,
        room_id: Uuid,
        identity: &str,
        connection_type: Option<&str>,
        metadata: serde_json::Value,
    ) -> StoreResult<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO participants
                (id, room_id, identity, connection_type, joined_at, left_at, is_active, metadata)
            VALUES ($1, $2, $3, $4, now(), NULL, TRUE, $5)
            ON CONFLICT (room_id, identity) DO UPDATE
               SET connection_type = EXCLUDED.connection_type,
                   joined_at = now(),
                   left_at = NULL,
                   is_active = TRUE,
                   metadata = EXCLUDED.metadata
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(room_id)
        .bind(identity)
        .bind(connection_type)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_participant_left(&self, room_id: Uuid, identity: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE participants
               SET left_at = now(),
                   is_active = FALSE
             WHERE room_id = $1 AND identity = $2
            "#,
        )
        .bind(room_id)
        .bind(identity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_room_participants(&self, room_id: Uuid) -> StoreResult<u64> {
        let closed = sqlx::query(
            r#"
            UPDATE participants
               SET left_at = now(),
                   is_active = FALSE
             WHERE room_id = $1 AND is_active
            "#,
        )
        .bind(room_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(closed)
    }

    async fn insert_stt_session(&self, room_id: Uuid, participant_id: Uuid) -> StoreResult<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO stt_sessions
                (id, room_id, participant_id, status, started_at,
                 audio_minutes, transcript_count, average_confidence)
            VALUES ($1, $2, $3, 'active', now(), 0, 0, 0)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(room_id)
        .bind(participant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn close_stt_session(&self, close: SessionClose) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE stt_sessions
               SET status = $2,
                   ended_at = $3,
                   audio_minutes = $4,
                   transcript_count = $5,
                   average_confidence = $6,
                   error_message = $7,
                   external_session_tag = COALESCE($8, external_session_tag)
             WHERE id = $1
            "#,
        )
        .bind(close.session_id)
        .bind(close.status)
        .bind(close.ended_at)
        .bind(close.audio_minutes)
        .bind(close.transcript_count)
        .bind(close.average_confidence)
        .bind(close.error_message)
        .bind(close.external_session_tag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_transcripts(&self, rows: &[NewTranscript]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut qb = QueryBuilder::new(
            "INSERT INTO transcripts \
             (id, room_id, stt_session_id, participant_id, text, is_final, confidence, \
              relative_timestamp_seconds, start_time, end_time, language, \
              wall_clock_timestamp, organization_id, metadata) ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(Uuid::new_v4())
                .push_bind(row.room_id)
                .push_bind(row.stt_session_id)
                .push_bind(row.participant_id)
                .push_bind(&row.text)
                .push_bind(true)
                .push_bind(row.confidence)
                .push_bind(row.relative_timestamp_seconds)
                .push_bind(row.start_time)
                .push_bind(row.end_time)
                .push_bind(&row.language)
                .push_bind(row.wall_clock_timestamp)
                .push_bind(row.organization_id)
                .push_bind(serde_json::Value::Object(Default::default()));
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn get_conference_server(&self, name: &str) -> StoreResult<Option<ConferenceServer>> {
        let server = sqlx::query_as::<_, ConferenceServer>(
            "SELECT * FROM conference_servers WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(server)
    }

    async fn get_service_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let value =
            sqlx::query_scalar::<_, String>("SELECT value FROM service_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn room_has_jobs(&self, room_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM analysis_jobs WHERE room_id = $1)")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<bool, _>(0))
    }

    async fn insert_fallback_jobs(
        &self,
        room_id: Uuid,
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        let mut qb = QueryBuilder::new(
            "INSERT INTO analysis_jobs \
             (id, room_id, job_type, priority, status, payload, attempts, created_at) ",
        );
        qb.push_values(AnalysisJob::CANONICAL_SET, |mut b, (job_type, priority)| {
            b.push_bind(Uuid::new_v4())
                .push_bind(room_id)
                .push_bind(job_type)
                .push_bind(priority)
                .push_bind(JobStatus::Pending)
                .push_bind(payload.clone())
                .push_bind(0_i32)
                .push("now()");
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn claim_next_job(&self) -> StoreResult<Option<AnalysisJob>> {
        let job = sqlx::query_as::<_, AnalysisJob>(
            r#"
            UPDATE analysis_jobs
               SET status = 'running',
                   started_at = now(),
                   attempts = attempts + 1
             WHERE id = (SELECT id FROM analysis_jobs
                          WHERE status = 'pending'
                          ORDER BY priority DESC, created_at ASC
                          LIMIT 1
                          FOR UPDATE SKIP LOCKED)
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        outcome: Result<serde_json::Value, String>,
    ) -> StoreResult<()> {
        match outcome {
            Ok(result) => {
                sqlx::query(
                    r#"
                    UPDATE analysis_jobs
                       SET status = 'completed',
                           result = $2,
                           completed_at = now()
                     WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(result)
                .execute(&self.pool)
                .await?;
            }
            Err(message) => {
                sqlx::query(
                    r#"
                    UPDATE analysis_jobs
                       SET status = 'failed',
                           error_message = $2,
                           completed_at = now()
                     WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(message)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn fetch_room_transcripts(&self, room_id: Uuid) -> StoreResult<Vec<TranscriptRow>> {
        let rows = sqlx::query_as::<_, TranscriptRow>(
            r#"
            SELECT * FROM transcripts
             WHERE room_id = $1
             ORDER BY relative_timestamp_seconds ASC
            "#,
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
