use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use roomscribe_db::SttSessionStatus;
use roomscribe_store::{SessionClose, StoreError, StoreGateway};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::UtteranceAggregator;
use crate::config::TranscriptionConfig;
use crate::sink::{PendingRow, TranscriptSink};
use crate::stt::messages::{AudioFormat, ClientMessage, RecognitionConfig, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to connect to transcription provider: {0}")]
    Connect(String),
}

/// Stream lifecycle. `Failed` is reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum StreamState {
    Idle = 0,
    Opening = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
    Failed = 5,
}

#[derive(Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new(state: StreamState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn load(&self) -> StreamState {
        match self.0.load(Ordering::SeqCst) {
            0 => StreamState::Idle,
            1 => StreamState::Opening,
            2 => StreamState::Active,
            3 => StreamState::Draining,
            4 => StreamState::Closed,
            _ => StreamState::Failed,
        }
    }

    fn store(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

enum WriterCmd {
    Audio(Vec<u8>),
    /// Half-close sentinel: one empty binary payload.
    EndOfStream,
}

#[derive(Default)]
struct SessionStats {
    external_tag: Option<String>,
    transcript_count: i32,
    confidence_sum: f64,
    /// Set once the failed row has been written; stop() then skips the
    /// completed update.
    failure_recorded: bool,
}

/// Cheap handle the audio adapter writes through. Drops audio silently
/// while the stream is not active.
#[derive(Clone)]
pub struct AudioLane {
    state: StateCell,
    writer_tx: mpsc::Sender<WriterCmd>,
}

impl AudioLane {
    pub fn send_audio(&self, pcm: Vec<u8>) {
        if self.state.load() != StreamState::Active {
            return;
        }
        // try_send: audio never blocks the adapter; a full lane sheds.
        let _ = self.writer_tx.try_send(WriterCmd::Audio(pcm));
    }
}

/// One bidirectional provider stream per participant track.
///
/// `start` creates the session row and opens the stream; fragments flow
/// through the utterance aggregator into the shared sink; `stop` drains,
/// half-closes, and records session statistics exactly once.
pub struct SttStreamClient {
    session_id: Uuid,
    state: StateCell,
    lane: AudioLane,
    stats: Arc<Mutex<SessionStats>>,
    store: Arc<dyn StoreGateway>,
    started_at: DateTime<Utc>,
    close_grace: std::time::Duration,
    drained: Arc<Notify>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    writer_tx: mpsc::Sender<WriterCmd>,
}

impl SttStreamClient {
    /// Opens the stream: session row, websocket, `StartRecognition`.
    pub async fn start(
        config: &TranscriptionConfig,
        store: Arc<dyn StoreGateway>,
        sink: Arc<TranscriptSink>,
        room_id: Uuid,
        participant_id: Uuid,
        parent: &CancellationToken,
    ) -> Result<Self, SttError> {
        let session_id = store.insert_stt_session(room_id, participant_id).await?;
        let started_at = Utc::now();
        let state = StateCell::new(StreamState::Opening);
        let stats = Arc::new(Mutex::new(SessionStats::default()));

        let mut ws = match connect(config).await {
            Ok(ws) => ws,
            Err(e) => {
                state.store(StreamState::Failed);
                record_failure(
                    &*store,
                    session_id,
                    started_at,
                    &stats,
                    format!("connect failed: {e}"),
                )
                .await;
                return Err(e);
            }
        };

        let start_frame = ClientMessage::StartRecognition {
            audio_format: AudioFormat::pcm_16k_mono(),
            transcription_config: RecognitionConfig::from_config(config),
        };
        let start_json = serde_json::to_string(&start_frame)
            .map_err(|e| SttError::Connect(format!("serialize StartRecognition: {e}")))?;
        if let Err(e) = ws.send(Message::text(start_json)).await {
            state.store(StreamState::Failed);
            record_failure(
                &*store,
                session_id,
                started_at,
                &stats,
                format!("handshake failed: {e}"),
            )
            .await;
            return Err(SttError::Connect(e.to_string()));
        }

        let (mut write, read) = ws.split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCmd>(64);
        let cancel = parent.child_token();
        let drained = Arc::new(Notify::new());

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    cmd = writer_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };
                match cmd {
                    WriterCmd::Audio(pcm) => {
                        if write.send(Message::binary(pcm)).await.is_err() {
                            break;
                        }
                    }
                    WriterCmd::EndOfStream => {
                        let _ = write.send(Message::binary(Vec::<u8>::new())).await;
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(reader_loop(ReaderCtx {
            read,
            store: Arc::clone(&store),
            sink,
            state: state.clone(),
            stats: Arc::clone(&stats),
            aggregator: UtteranceAggregator::new(
                config.utterance_max_chars,
                config.utterance_idle_flush,
            ),
            session_id,
            participant_id,
            started_at,
            drained: Arc::clone(&drained),
            cancel: cancel.clone(),
        }));

        info!(%session_id, %participant_id, "STT stream opened");

        Ok(Self {
            session_id,
            lane: AudioLane {
                state: state.clone(),
                writer_tx: writer_tx.clone(),
            },
            state,
            stats,
            store,
            started_at,
            close_grace: config.close_grace,
            drained,
            cancel,
            writer,
            reader,
            writer_tx,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn audio_lane(&self) -> AudioLane {
        self.lane.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.load() == StreamState::Active
    }

    /// Drains, half-closes, waits briefly for the provider's ack, then
    /// closes the transport and records the session row.
    pub async fn stop(self) {
        let state_before = self.state.load();
        if state_before == StreamState::Active || state_before == StreamState::Opening {
            self.state.store(StreamState::Draining);
            let _ = self.writer_tx.send(WriterCmd::EndOfStream).await;
            // Clean close: the provider answers with EndOfTranscript.
            let _ = tokio::time::timeout(self.close_grace, self.drained.notified()).await;
        }

        self.cancel.cancel();
        let _ = self.writer.await;
        let _ = self.reader.await;

        let mut stats = self.stats.lock().await;
        if !stats.failure_recorded {
            if self.state.load() != StreamState::Failed {
                self.state.store(StreamState::Closed);
            }
            let close = session_close(
                self.session_id,
                &stats,
                SttSessionStatus::Completed,
                self.started_at,
                None,
            );
            if let Err(e) = self.store.close_stt_session(close).await {
                warn!(session_id = %self.session_id, error = %e, "Failed to record session close");
            }
            stats.failure_recorded = true;
        }

        debug!(session_id = %self.session_id, "STT stream stopped");
    }
}

async fn connect(config: &TranscriptionConfig) -> Result<WsStream, SttError> {
    let mut request = config
        .provider_endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| SttError::Connect(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.provider_api_key))
        .map_err(|e| SttError::Connect(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| SttError::Connect(e.to_string()))?;
    Ok(ws)
}

struct ReaderCtx {
    read: SplitStream<WsStream>,
    store: Arc<dyn StoreGateway>,
    sink: Arc<TranscriptSink>,
    state: StateCell,
    stats: Arc<Mutex<SessionStats>>,
    aggregator: UtteranceAggregator,
    session_id: Uuid,
    participant_id: Uuid,
    started_at: DateTime<Utc>,
    drained: Arc<Notify>,
    cancel: CancellationToken,
}

async fn reader_loop(mut ctx: ReaderCtx) {
    loop {
        let idle = async {
            match ctx.aggregator.idle_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let message = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = idle => {
                flush_aggregator(&mut ctx).await;
                continue;
            }
            message = ctx.read.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Protocol violations never crash the stream.
                        debug!(session_id = %ctx.session_id, error = %e, "Ignoring unknown provider message");
                        continue;
                    }
                };
                if !handle_server_message(&mut ctx, frame).await {
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let clean = frame
                    .as_ref()
                    .map(|f| f.code == CloseCode::Normal)
                    .unwrap_or(true);
                if clean || ctx.state.load() == StreamState::Draining {
                    ctx.state.store(StreamState::Closed);
                } else {
                    let reason = frame
                        .map(|f| format!("closed with code {}: {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed without a close frame".to_string());
                    fail_session(&mut ctx, reason).await;
                }
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                if ctx.state.load() != StreamState::Draining {
                    fail_session(&mut ctx, format!("transport error: {e}")).await;
                }
                break;
            }
            None => {
                if ctx.state.load() != StreamState::Draining {
                    fail_session(&mut ctx, "stream ended unexpectedly".to_string()).await;
                }
                break;
            }
        }
    }

    flush_aggregator(&mut ctx).await;
    ctx.drained.notify_waiters();
}

/// Returns `false` when the reader should stop.
async fn handle_server_message(ctx: &mut ReaderCtx, frame: ServerMessage) -> bool {
    match frame {
        ServerMessage::RecognitionStarted { id } => {
            if let Some(tag) = id {
                ctx.stats.lock().await.external_tag = Some(tag);
            }
            ctx.state.store(StreamState::Active);
            true
        }
        ServerMessage::AddTranscript(payload) => {
            let fragment = payload.to_fragment();
            {
                let mut stats = ctx.stats.lock().await;
                stats.transcript_count += 1;
                stats.confidence_sum += fragment.confidence;
            }
            if let Some(utterance) = ctx.aggregator.push(fragment) {
                enqueue_utterance(ctx, utterance).await;
            }
            true
        }
        ServerMessage::AddPartialTranscript(_) => {
            // Final-only persistence; partials are not consumed.
            true
        }
        ServerMessage::EndOfTranscript => {
            ctx.state.store(StreamState::Closed);
            false
        }
        ServerMessage::Error { kind, reason } => {
            let reason = match kind {
                Some(kind) => format!("{kind}: {reason}"),
                None => reason,
            };
            fail_session(ctx, reason).await;
            false
        }
        ServerMessage::Warning { reason } => {
            warn!(session_id = %ctx.session_id, %reason, "Provider warning");
            true
        }
    }
}

async fn flush_aggregator(ctx: &mut ReaderCtx) {
    if let Some(utterance) = ctx.aggregator.flush() {
        enqueue_utterance(ctx, utterance).await;
    }
}

async fn enqueue_utterance(ctx: &ReaderCtx, utterance: crate::aggregator::Utterance) {
    ctx.sink
        .enqueue(PendingRow {
            stt_session_id: ctx.session_id,
            participant_id: ctx.participant_id,
            text: utterance.text,
            is_final: true,
            confidence: utterance.confidence,
            start_time: utterance.start_time,
            end_time: utterance.end_time,
            language: utterance.language,
            wall_clock_timestamp: utterance.finalized_at,
        })
        .await;
}

async fn fail_session(ctx: &mut ReaderCtx, reason: String) {
    ctx.state.store(StreamState::Failed);
    warn!(session_id = %ctx.session_id, %reason, "STT session failed");
    record_failure(
        &*ctx.store,
        ctx.session_id,
        ctx.started_at,
        &ctx.stats,
        reason,
    )
    .await;
}

async fn record_failure(
    store: &dyn StoreGateway,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    stats: &Mutex<SessionStats>,
    reason: String,
) {
    let mut stats = stats.lock().await;
    if stats.failure_recorded {
        return;
    }
    let close = session_close(
        session_id,
        &stats,
        SttSessionStatus::Failed,
        started_at,
        Some(reason),
    );
    if let Err(e) = store.close_stt_session(close).await {
        warn!(%session_id, error = %e, "Failed to record session failure");
    }
    stats.failure_recorded = true;
}

fn session_close(
    session_id: Uuid,
    stats: &SessionStats,
    status: SttSessionStatus,
    started_at: DateTime<Utc>,
    error_message: Option<String>,
) -> SessionClose {
    let ended_at = Utc::now();
    let audio_minutes = (ended_at - started_at)
        .num_milliseconds()
        .max(0) as f64
        / 60_000.0;
    let average_confidence = if stats.transcript_count > 0 {
        stats.confidence_sum / stats.transcript_count as f64
    } else {
        0.0
    };

    SessionClose {
        session_id,
        external_session_tag: stats.external_tag.clone(),
        status,
        ended_at,
        audio_minutes,
        transcript_count: stats.transcript_count,
        average_confidence,
        error_message,
    }
}
