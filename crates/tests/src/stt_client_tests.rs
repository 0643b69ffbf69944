use std::sync::Arc;
use std::time::Duration;

use roomscribe_db::{Room, RoomStatus, SttSessionStatus};
use roomscribe_store::{StoreGateway, Timebase};
use roomscribe_transcription::{SttStreamClient, TranscriptSink, TranscriptionConfig};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::fixtures::{mock_provider::add_transcript, MemStore, MockProvider, ProviderBehavior};

struct Fixture {
    store: Arc<MemStore>,
    room: Room,
    sink: Arc<TranscriptSink>,
    config: TranscriptionConfig,
    participant_id: Uuid,
    cancel: CancellationToken,
}

async fn fixture(endpoint: String) -> Fixture {
    let store = Arc::new(MemStore::new());
    let room = store.seed_room("stt-room", RoomStatus::Processing);
    let participant_id = store
        .upsert_participant(room.id, "alice", Some("webrtc"), serde_json::Value::Null)
        .await
        .unwrap();

    let mut timebase = Timebase::new(room.id);
    timebase.initialize(&*store).await.unwrap();

    let config = TranscriptionConfig {
        provider_endpoint: endpoint,
        provider_api_key: "test-key".to_string(),
        ..TranscriptionConfig::default()
    };

    let cancel = CancellationToken::new();
    let sink = Arc::new(
        TranscriptSink::new(
            Arc::clone(&store) as Arc<dyn StoreGateway>,
            room.id,
            &timebase,
            &config,
            &cancel,
        )
        .unwrap(),
    );

    Fixture {
        store,
        room,
        sink,
        config,
        participant_id,
        cancel,
    }
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn finals_become_rows_and_the_session_completes() {
    let provider = MockProvider::start(ProviderBehavior::Fragments(vec![
        add_transcript("we should ship it.", 0.9, 0.0, 1.4),
        add_transcript("agreed!", 0.7, 1.5, 2.2),
    ]))
    .await;
    let fx = fixture(provider.endpoint()).await;

    let client = SttStreamClient::start(
        &fx.config,
        Arc::clone(&fx.store) as Arc<dyn StoreGateway>,
        Arc::clone(&fx.sink),
        fx.room.id,
        fx.participant_id,
        &fx.cancel,
    )
    .await
    .unwrap();

    let store = Arc::clone(&fx.store);
    let room_id = fx.room.id;
    wait_for("both transcript rows", || store.transcripts(room_id).len() == 2).await;

    let rows = fx.store.fetch_room_transcripts(room_id).await.unwrap();
    assert_eq!(rows[0].text, "we should ship it.");
    assert_eq!(rows[1].text, "agreed!");
    assert!(rows.iter().all(|r| r.is_final));
    assert!(rows.iter().all(|r| r.stt_session_id == client.session_id()));
    assert!(rows[0].relative_timestamp_seconds <= rows[1].relative_timestamp_seconds);

    // Audio flows once the provider has acknowledged.
    wait_for("active stream", || client.is_active()).await;
    client.audio_lane().send_audio(vec![0u8; 640]);
    wait_for("audio at the provider", || provider.audio_bytes() >= 640).await;

    client.stop().await;

    let sessions = fx.store.sessions(room_id);
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.status, SttSessionStatus::Completed);
    assert_eq!(session.transcript_count, 2);
    assert!((session.average_confidence - 0.8).abs() < 1e-9);
    assert_eq!(session.external_session_tag.as_deref(), Some("mock-session-1"));
    assert!(session.ended_at.is_some());
    assert!(session.audio_minutes >= 0.0);
}

#[tokio::test]
async fn provider_error_fails_the_session_only() {
    let provider = MockProvider::start(ProviderBehavior::ErrorAfterStart {
        reason: "out of quota".to_string(),
    })
    .await;
    let fx = fixture(provider.endpoint()).await;

    let client = SttStreamClient::start(
        &fx.config,
        Arc::clone(&fx.store) as Arc<dyn StoreGateway>,
        Arc::clone(&fx.sink),
        fx.room.id,
        fx.participant_id,
        &fx.cancel,
    )
    .await
    .unwrap();

    let store = Arc::clone(&fx.store);
    let room_id = fx.room.id;
    wait_for("failed session row", || {
        store
            .sessions(room_id)
            .first()
            .map(|s| s.status == SttSessionStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    let session = &fx.store.sessions(room_id)[0];
    assert!(session.error_message.as_deref().unwrap().contains("out of quota"));

    // send_audio after failure is a silent drop, and stop() must not
    // overwrite the failed status.
    client.audio_lane().send_audio(vec![0u8; 320]);
    client.stop().await;
    assert_eq!(fx.store.sessions(room_id)[0].status, SttSessionStatus::Failed);
}

#[tokio::test]
async fn unclean_close_fails_the_session_with_the_code() {
    let provider = MockProvider::start(ProviderBehavior::AbnormalClose).await;
    let fx = fixture(provider.endpoint()).await;

    let client = SttStreamClient::start(
        &fx.config,
        Arc::clone(&fx.store) as Arc<dyn StoreGateway>,
        Arc::clone(&fx.sink),
        fx.room.id,
        fx.participant_id,
        &fx.cancel,
    )
    .await
    .unwrap();

    let store = Arc::clone(&fx.store);
    let room_id = fx.room.id;
    wait_for("failed session row", || {
        store
            .sessions(room_id)
            .first()
            .map(|s| s.status == SttSessionStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    let session = &fx.store.sessions(room_id)[0];
    assert!(session.error_message.as_deref().unwrap().contains("closed with code"));

    client.stop().await;
}

#[tokio::test]
async fn unreachable_provider_fails_the_start() {
    let fx = fixture("ws://127.0.0.1:9".to_string()).await;

    let result = SttStreamClient::start(
        &fx.config,
        Arc::clone(&fx.store) as Arc<dyn StoreGateway>,
        Arc::clone(&fx.sink),
        fx.room.id,
        fx.participant_id,
        &fx.cancel,
    )
    .await;

    assert!(result.is_err());
    let sessions = fx.store.sessions(fx.room.id);
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SttSessionStatus::Failed);
}
