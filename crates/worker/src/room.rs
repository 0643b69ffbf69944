use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use roomscribe_conference::{is_hidden_worker, CallEnd, CallEndDetector, RoomEvent, RoomHandle};
use roomscribe_db::Room;
use roomscribe_store::StoreGateway;
use roomscribe_transcription::{AudioPump, SttStreamClient, TranscriptSink, TranscriptionConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a forced call end may take during graceful shutdown.
const FORCED_END_GRACE: Duration = Duration::from_secs(2);

/// Why the room loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomOutcome {
    CallEnded,
    Disconnected,
    Shutdown,
}

struct TrackPipeline {
    pump: AudioPump,
    client: SttStreamClient,
}

/// Drives one owned room: tracks human participants, runs a {stream
/// client, audio pump} pair per audio track, and watches for call end.
///
/// Teardown is leaves-first: pumps, then stream clients, then the sink,
/// then the room connection.
pub struct RoomRunner {
    store: Arc<dyn StoreGateway>,
    sink: Arc<TranscriptSink>,
    stt_config: TranscriptionConfig,
    room: Room,
    cancel: CancellationToken,
    /// identity -> participant row id
    participants: HashMap<String, Uuid>,
    /// "identity:track_id" -> pipeline pair
    pipelines: HashMap<String, TrackPipeline>,
    detector: CallEndDetector,
    call_end_rx: mpsc::Receiver<CallEnd>,
}

impl RoomRunner {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        sink: Arc<TranscriptSink>,
        stt_config: TranscriptionConfig,
        room: Room,
        cancel: CancellationToken,
    ) -> Self {
        let empty_timeout = Duration::from_secs(room.empty_timeout_seconds.max(1) as u64);
        let (mut detector, call_end_rx) = CallEndDetector::new(empty_timeout);
        // The claim may precede any participant; an untouched room still
        // times out.
        detector.update(0);

        Self {
            store,
            sink,
            stt_config,
            room,
            cancel,
            participants: HashMap::new(),
            pipelines: HashMap::new(),
            detector,
            call_end_rx,
        }
    }

    /// Runs until call end, disconnect, or shutdown, then tears every
    /// pipeline down and flushes the sink.
    pub async fn run(mut self, mut handle: RoomHandle) -> RoomOutcome {
        let outcome = self.event_loop(&mut handle).await;

        info!(room_id = %self.room.id, ?outcome, "Room loop exited, tearing down");
        self.stop_pipelines().await;
        self.sink.stop().await;
        handle.disconnect();
        outcome
    }

    async fn event_loop(&mut self, handle: &mut RoomHandle) -> RoomOutcome {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.detector.force();
                    let _ = tokio::time::timeout(FORCED_END_GRACE, self.call_end_rx.recv()).await;
                    return RoomOutcome::Shutdown;
                }
                fired = self.call_end_rx.recv() => {
                    if fired.is_some() {
                        return RoomOutcome::CallEnded;
                    }
                }
                event = handle.next_event() => {
                    match event {
                        Some(RoomEvent::Disconnected { reason }) => {
                            warn!(room_id = %self.room.id, %reason, "Room disconnected");
                            return RoomOutcome::Disconnected;
                        }
                        Some(event) => self.handle_event(event).await,
                        None => return RoomOutcome::Disconnected,
                    }
                    if !handle.is_connected() {
                        return RoomOutcome::Disconnected;
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::ParticipantJoined {
                identity,
                connection_type,
                metadata,
            } => {
                if is_worker(&identity, &metadata) {
                    return;
                }
                match self
                    .store
                    .upsert_participant(
                        self.room.id,
                        &identity,
                        connection_type.as_deref(),
                        metadata,
                    )
                    .await
                {
                    Ok(participant_id) => {
                        info!(room_id = %self.room.id, %identity, "Participant joined");
                        self.participants.insert(identity, participant_id);
                    }
                    Err(e) => {
                        // Transient: the track event retries the upsert.
                        warn!(%identity, error = %e, "Participant upsert failed");
                    }
                }
                self.detector.update(self.participants.len());
            }
            RoomEvent::ParticipantLeft { identity } => {
                if identity.starts_with("worker-") {
                    return;
                }
                if let Err(e) = self
                    .store
                    .mark_participant_left(self.room.id, &identity)
                    .await
                {
                    warn!(%identity, error = %e, "Participant leave update failed");
                }
                self.participants.remove(&identity);
                self.teardown_participant(&identity).await;
                info!(room_id = %self.room.id, %identity, remaining = self.participants.len(), "Participant left");
                self.detector.update(self.participants.len());
            }
            RoomEvent::TrackSubscribed {
                identity,
                track_id,
                frames,
            } => {
                if identity.starts_with("worker-") {
                    return;
                }
                self.spawn_pipeline(identity, track_id, frames).await;
            }
            RoomEvent::Disconnected { .. } => {}
        }
    }

    async fn spawn_pipeline(
        &mut self,
        identity: String,
        track_id: String,
        frames: mpsc::Receiver<roomscribe_conference::AudioFrame>,
    ) {
        let participant_id = match self.participants.get(&identity) {
            Some(id) => *id,
            None => {
                // Track event raced the join event; upsert now.
                match self
                    .store
                    .upsert_participant(self.room.id, &identity, None, serde_json::Value::Null)
                    .await
                {
                    Ok(id) => {
                        self.participants.insert(identity.clone(), id);
                        self.detector.update(self.participants.len());
                        id
                    }
                    Err(e) => {
                        warn!(%identity, error = %e, "Cannot create participant for track, dropping");
                        return;
                    }
                }
            }
        };

        let key = format!("{identity}:{track_id}");
        if self.pipelines.contains_key(&key) {
            debug!(%key, "Pipeline already running for track");
            return;
        }

        let client = match SttStreamClient::start(
            &self.stt_config,
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            self.room.id,
            participant_id,
            &self.cancel,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                // The session row is already marked failed; the room keeps
                // going for everyone else.
                warn!(%key, error = %e, "STT stream failed to open");
                return;
            }
        };

        let pump = AudioPump::spawn(frames, client.audio_lane(), &self.cancel);
        info!(room_id = %self.room.id, %key, session_id = %client.session_id(), "Transcription pipeline started");
        self.pipelines.insert(key, TrackPipeline { pump, client });
    }

    async fn teardown_participant(&mut self, identity: &str) {
        let prefix = format!("{identity}:");
        let keys: Vec<String> = self
            .pipelines
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            if let Some(pipeline) = self.pipelines.remove(&key) {
                pipeline.pump.stop().await;
                pipeline.client.stop().await;
                debug!(%key, "Transcription pipeline stopped");
            }
        }
    }

    async fn stop_pipelines(&mut self) {
        for (key, pipeline) in self.pipelines.drain() {
            pipeline.pump.stop().await;
            pipeline.client.stop().await;
            debug!(%key, "Transcription pipeline stopped");
        }
    }
}

fn is_worker(identity: &str, metadata: &serde_json::Value) -> bool {
    identity.starts_with("worker-") || is_hidden_worker(metadata)
}
