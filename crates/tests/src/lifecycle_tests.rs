use std::sync::Arc;
use std::time::Duration;

use roomscribe_conference::AudioFrame;
use roomscribe_config::WorkerConfig;
use roomscribe_db::{RoomStatus, WorkerMode, WorkerStatus};
use roomscribe_store::StoreGateway;
use roomscribe_worker::WorkerManager;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::fixtures::{mock_provider::add_transcript, FakeConference, MemStore, MockProvider, ProviderBehavior};

fn test_config(worker_id: Uuid) -> WorkerConfig {
    WorkerConfig {
        store_url: "postgres://unused.invalid/roomscribe".to_string(),
        store_service_key: "unused".to_string(),
        store_direct_url: None,
        store_realtime_url: None,
        mode: WorkerMode::Transcription,
        worker_id,
        polling_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(500),
        realtime_timeout: Duration::from_secs(30),
        realtime_retry_interval: Duration::from_secs(120),
        claim_cache_duration: Duration::from_secs(30),
        enable_polling_fallback: true,
        enable_database_notify: false,
        log_level: "info".to_string(),
        health_port: None,
    }
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct Harness {
    store: Arc<MemStore>,
    conference: Arc<FakeConference>,
    shutdown: CancellationToken,
    manager: tokio::task::JoinHandle<anyhow::Result<()>>,
    worker_id: Uuid,
    _provider: MockProvider,
}

async fn start_worker(provider: MockProvider, empty_timeout_seconds: i32) -> (Harness, Uuid) {
    let store = Arc::new(MemStore::new());
    store.seed_server("cluster-a");
    store.set_setting("stt_endpoint", &provider.endpoint());
    store.set_setting("stt_api_key", "test-key");

    let mut room = store.seed_room("standup", RoomStatus::Pending);
    room.empty_timeout_seconds = empty_timeout_seconds;
    store.put_room(room.clone());

    let worker_id = Uuid::new_v4();
    let conference = FakeConference::new();
    let shutdown = CancellationToken::new();
    let mut manager = WorkerManager::new(
        test_config(worker_id),
        Arc::clone(&store) as Arc<dyn StoreGateway>,
        Arc::clone(&conference) as Arc<dyn roomscribe_conference::ConferenceBackend>,
        shutdown.clone(),
    );
    let task = tokio::spawn(async move { manager.run().await });

    (
        Harness {
            store,
            conference,
            shutdown,
            manager: task,
            worker_id,
            _provider: provider,
        },
        room.id,
    )
}

#[tokio::test]
async fn single_room_happy_path() {
    let provider = MockProvider::start(ProviderBehavior::Fragments(vec![
        add_transcript("we should ship it.", 0.9, 0.0, 1.4),
        add_transcript("agreed, ship today!", 0.8, 1.5, 2.9),
    ]))
    .await;
    let (h, room_id) = start_worker(provider, 2).await;

    // Discovery claims the pending room and joins the conference.
    let store = Arc::clone(&h.store);
    wait_for("room claimed", || {
        store
            .room(room_id)
            .map(|r| r.status == RoomStatus::Processing && r.owner_worker_id == Some(h.worker_id))
            .unwrap_or(false)
    })
    .await;
    let conference = Arc::clone(&h.conference);
    wait_for("conference joined", || conference.join_count() == 1).await;
    let script = h.conference.latest_script().unwrap();

    // A participant joins and publishes audio.
    script.participant_joins("alice").await;
    let frames = script.publishes_track("alice", "track-1").await;
    frames
        .send(AudioFrame {
            samples: vec![0i16; 320],
            sample_rate: 16_000,
            channels: 1,
        })
        .await
        .unwrap();

    wait_for("participant row", || !store.participants(room_id).is_empty()).await;
    wait_for("two transcript rows", || store.transcripts(room_id).len() == 2).await;

    let rows = h.store.fetch_room_transcripts(room_id).await.unwrap();
    assert!(rows.iter().all(|r| r.is_final));
    assert!(rows.iter().all(|r| r.relative_timestamp_seconds >= 0.0));
    assert!(rows[0].relative_timestamp_seconds <= rows[1].relative_timestamp_seconds);

    // Everyone leaves; the empty-room window elapses; exactly one
    // finalize runs.
    script.participant_leaves("alice").await;
    wait_for("room completed", || {
        store
            .room(room_id)
            .map(|r| r.status == RoomStatus::Completed && r.closed_at.is_some())
            .unwrap_or(false)
    })
    .await;

    let room = h.store.room(room_id).unwrap();
    assert!(room.owner_worker_id.is_none());
    assert!(room.owner_heartbeat_at.is_none());

    let participants = h.store.participants(room_id);
    assert!(!participants.is_empty());
    assert!(participants.iter().all(|p| !p.is_active && p.left_at.is_some()));

    let jobs = h.store.jobs(room_id);
    assert_eq!(jobs.len(), 4);
    let mut types: Vec<&str> = jobs.iter().map(|j| j.job_type.as_str()).collect();
    types.sort_unstable();
    assert_eq!(types, ["action_items", "sentiment", "speaker_analytics", "summary"]);

    let sessions = h.store.sessions(room_id);
    assert_eq!(sessions.len(), 1);

    h.shutdown.cancel();
    h.manager.await.unwrap().unwrap();
    assert_eq!(h.store.worker(h.worker_id).unwrap().status, WorkerStatus::Stopped);
}

#[tokio::test]
async fn conference_disconnect_finalizes_the_room() {
    let provider = MockProvider::start(ProviderBehavior::Fragments(vec![])).await;
    let (h, room_id) = start_worker(provider, 600).await;

    let store = Arc::clone(&h.store);
    let conference = Arc::clone(&h.conference);
    wait_for("conference joined", || conference.join_count() == 1).await;
    let script = h.conference.latest_script().unwrap();
    script.participant_joins("bob").await;

    script.disconnects("media server restart").await;

    wait_for("room completed after disconnect", || {
        store
            .room(room_id)
            .map(|r| r.status == RoomStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    h.shutdown.cancel();
    h.manager.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_mid_room_forces_a_prompt_finalize() {
    let provider = MockProvider::start(ProviderBehavior::Fragments(vec![])).await;
    let (h, room_id) = start_worker(provider, 600).await;

    let store = Arc::clone(&h.store);
    let conference = Arc::clone(&h.conference);
    wait_for("conference joined", || conference.join_count() == 1).await;
    let script = h.conference.latest_script().unwrap();
    // A live participant would normally keep the room open for 600 s.
    script.participant_joins("carol").await;
    wait_for("participant row", || !store.participants(room_id).is_empty()).await;

    h.shutdown.cancel();
    h.manager.await.unwrap().unwrap();

    let room = h.store.room(room_id).unwrap();
    assert_eq!(room.status, RoomStatus::Completed);
    assert!(room.owner_worker_id.is_none());
    assert_eq!(h.store.worker(h.worker_id).unwrap().status, WorkerStatus::Stopped);
}
