use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use roomscribe_conference::{ConferenceBackend, ConferenceError};
use roomscribe_config::WorkerConfig;
use roomscribe_db::Room;
use roomscribe_store::{StoreError, StoreGateway, Timebase, TimebaseError, CLAIM_STALE_AFTER};
use roomscribe_transcription::{TranscriptSink, TranscriptionConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::discovery::{ClaimedRoom, DiscoveryMethod, RoomDiscovery};
use crate::jobs::AiJobsDriver;
use crate::room::{RoomOutcome, RoomRunner};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
/// Back-off after a room iteration hit a missing-config row.
const LOGICAL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum RoomError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("conference: {0}")]
    Conference(#[from] ConferenceError),
    #[error(transparent)]
    Timebase(#[from] TimebaseError),
}

impl RoomError {
    /// Logical errors (absent config rows, rejected joins) get the 5 s
    /// back-off; transient store errors just release and let discovery
    /// retry.
    fn is_logical(&self) -> bool {
        matches!(
            self,
            RoomError::Store(StoreError::MissingConfig(_)) | RoomError::Conference(_)
        )
    }
}

/// Owns the worker lifecycle: registration, heartbeat, reaper, discovery,
/// the single-room loop, and graceful shutdown.
pub struct WorkerManager {
    config: WorkerConfig,
    store: Arc<dyn StoreGateway>,
    conference: Arc<dyn ConferenceBackend>,
    shutdown: CancellationToken,
    /// Single-room gate, shared with discovery (held through claims).
    processing: Arc<AtomicBool>,
    current_room: Arc<StdMutex<Option<Uuid>>>,
    claims_by_method: HashMap<DiscoveryMethod, u64>,
    rooms_processed: u64,
}

impl WorkerManager {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn StoreGateway>,
        conference: Arc<dyn ConferenceBackend>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            conference,
            shutdown,
            processing: Arc::new(AtomicBool::new(false)),
            current_room: Arc::new(StdMutex::new(None)),
            claims_by_method: HashMap::new(),
            rooms_processed: 0,
        }
    }

    /// Runs the worker until the shutdown token fires. The caller installs
    /// the signal handlers that cancel the token.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let worker_id = self.config.worker_id;
        info!(%worker_id, mode = %self.config.mode, "Worker starting");

        // Best-effort sweep before registering; a previous generation may
        // have died holding rooms.
        match self.store.reap_stale_workers(CLAIM_STALE_AFTER).await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "Reaped stale workers at startup"),
            Err(e) => warn!(error = %e, "Startup reap failed"),
        }

        self.store
            .register_worker(worker_id, self.config.mode)
            .await?;

        let heartbeat = self.spawn_heartbeat();
        let reaper = self.spawn_reaper();

        let jobs = if self.config.mode.runs_ai_jobs() {
            Some(AiJobsDriver::start(
                Arc::clone(&self.store),
                &self.shutdown,
            ))
        } else {
            None
        };

        if self.config.mode.runs_transcription() {
            self.transcription_loop().await;
        } else {
            self.shutdown.cancelled().await;
        }

        // Shutdown: discovery is already stopped by the loop; drain the
        // rest in reverse construction order.
        if let Some(jobs) = jobs {
            jobs.stop().await;
        }
        heartbeat.abort();
        reaper.abort();

        if let Err(e) = self.store.mark_worker_stopped(worker_id).await {
            warn!(error = %e, "Failed to mark worker stopped");
        }

        info!(
            %worker_id,
            rooms_processed = self.rooms_processed,
            claims = ?self.claims_by_method,
            "Worker stopped"
        );
        Ok(())
    }

    async fn transcription_loop(&mut self) {
        let (claim_tx, mut claim_rx) = mpsc::channel(4);
        let discovery = RoomDiscovery::start(
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.processing),
            claim_tx,
            &self.shutdown,
        );

        discovery.startup_sweep().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                claimed = claim_rx.recv() => {
                    let Some(claimed) = claimed else { break };
                    self.process_claim(claimed, &discovery).await;
                }
            }
        }

        discovery.stop().await;
    }

    async fn process_claim(&mut self, claimed: ClaimedRoom, discovery: &RoomDiscovery) {
        let ClaimedRoom { room, method } = claimed;
        let room_id = room.id;
        *self.claims_by_method.entry(method).or_insert(0) += 1;
        *self.current_room.lock().unwrap_or_else(|e| e.into_inner()) = Some(room_id);

        info!(%room_id, room = %room.name, %method, "Processing room");
        let backoff = match self.drive_room(room.clone()).await {
            Ok(outcome) => {
                self.finalize_room(&room).await;
                self.rooms_processed += 1;
                info!(%room_id, ?outcome, "Room finalized");
                false
            }
            Err(e) => {
                warn!(%room_id, error = %e, "Room iteration aborted, releasing claim");
                if let Err(release_err) = self
                    .store
                    .release_room(self.config.worker_id, room_id)
                    .await
                {
                    warn!(%room_id, error = %release_err, "Release after abort failed");
                }
                e.is_logical()
            }
        };

        *self.current_room.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.processing.store(false, Ordering::SeqCst);
        discovery.clear_room(room_id);

        if backoff {
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(LOGICAL_ERROR_BACKOFF) => {}
            }
        }
        discovery.check_now();
    }

    /// Builds the room's component set in dependency order and drives it
    /// until call end, disconnect, or shutdown.
    async fn drive_room(&self, room: Room) -> Result<RoomOutcome, RoomError> {
        let server = self
            .store
            .get_conference_server(&room.server_ref)
            .await?
            .ok_or_else(|| {
                StoreError::MissingConfig(format!("conference server '{}'", room.server_ref))
            })?;

        let stt_config = self.load_stt_config().await?;

        let mut timebase = Timebase::new(room.id);
        timebase.initialize(&*self.store).await?;

        let room_cancel = self.shutdown.child_token();
        let sink = Arc::new(TranscriptSink::new(
            Arc::clone(&self.store),
            room.id,
            &timebase,
            &stt_config,
            &room_cancel,
        )?);

        let handle = match self
            .conference
            .join(&server, &room.name, self.config.worker_id)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                sink.stop().await;
                return Err(e.into());
            }
        };

        let runner = RoomRunner::new(
            Arc::clone(&self.store),
            sink,
            stt_config,
            room,
            room_cancel,
        );
        Ok(runner.run(handle).await)
    }

    async fn load_stt_config(&self) -> Result<TranscriptionConfig, RoomError> {
        let endpoint = self
            .store
            .get_service_setting("stt_endpoint")
            .await?
            .ok_or_else(|| StoreError::MissingConfig("service setting 'stt_endpoint'".into()))?;
        let api_key = self
            .store
            .get_service_setting("stt_api_key")
            .await?
            .ok_or_else(|| StoreError::MissingConfig("service setting 'stt_api_key'".into()))?;
        let language = self
            .store
            .get_service_setting("stt_language")
            .await?
            .unwrap_or_else(|| "en".to_string());

        Ok(TranscriptionConfig {
            provider_endpoint: endpoint,
            provider_api_key: api_key,
            language,
            ..TranscriptionConfig::default()
        })
    }

    /// Idempotent: every step is conditioned store-side, so a crashed or
    /// repeated finalize converges on the same terminal row state.
    async fn finalize_room(&self, room: &Room) {
        if let Err(e) = self.store.complete_room(room.id).await {
            warn!(room_id = %room.id, error = %e, "complete_room failed");
        }

        match self.store.close_room_participants(room.id).await {
            Ok(0) => {}
            Ok(closed) => info!(room_id = %room.id, closed, "Closed lingering participant rows"),
            Err(e) => warn!(room_id = %room.id, error = %e, "Participant close failed"),
        }

        // The completion webhook is the authoritative job scheduler; this
        // fallback only fills the gap when it has not run. Both sides
        // check for existing rows, so the race is benign.
        if room.ai_enabled {
            match self.store.room_has_jobs(room.id).await {
                Ok(true) => {}
                Ok(false) => {
                    let payload = serde_json::json!({
                        "room_id": room.id,
                        "room_name": room.name,
                    });
                    if let Err(e) = self.store.insert_fallback_jobs(room.id, payload).await {
                        warn!(room_id = %room.id, error = %e, "Fallback job insert failed");
                    } else {
                        info!(room_id = %room.id, "Inserted fallback analysis jobs");
                    }
                }
                Err(e) => warn!(room_id = %room.id, error = %e, "Job existence check failed"),
            }
        }

        if let Err(e) = self
            .store
            .release_room(self.config.worker_id, room.id)
            .await
        {
            warn!(room_id = %room.id, error = %e, "Release failed");
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let worker_id = self.config.worker_id;
        let interval = self.config.heartbeat_interval;
        let current_room = Arc::clone(&self.current_room);
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let room_id = *current_room.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = store.update_heartbeat(worker_id, room_id).await {
                    // Next tick retries; 45 s of misses forfeits ownership.
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        })
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.reap_stale_workers(CLAIM_STALE_AFTER).await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "Reaped stale workers"),
                    Err(e) => warn!(error = %e, "Reaper pass failed"),
                }
            }
        })
    }
}
