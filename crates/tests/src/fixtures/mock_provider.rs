//! A local websocket server speaking the provider wire contract, so the
//! stream client can be tested end to end without the real service.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub enum ProviderBehavior {
    /// Ack the start frame, emit these control frames (usually
    /// `AddTranscript`s), then answer the empty-payload sentinel with
    /// `EndOfTranscript` and a clean close.
    Fragments(Vec<serde_json::Value>),
    /// Ack, then report a provider-side error.
    ErrorAfterStart { reason: String },
    /// Ack, then drop the connection with a non-normal close code.
    AbnormalClose,
}

/// Builds an `AddTranscript` frame the way the provider shapes them.
pub fn add_transcript(text: &str, confidence: f64, start: f64, end: f64) -> serde_json::Value {
    serde_json::json!({
        "message": "AddTranscript",
        "metadata": { "transcript": text, "start_time": start, "end_time": end },
        "results": [
            { "alternatives": [ { "content": text, "confidence": confidence, "language": "en" } ] }
        ],
    })
}

pub struct MockProvider {
    addr: SocketAddr,
    audio_bytes: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl MockProvider {
    pub async fn start(behavior: ProviderBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock provider");
        let addr = listener.local_addr().expect("mock provider addr");
        let audio_bytes = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&audio_bytes);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let behavior = behavior.clone();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        let _ = serve_session(ws, behavior, counter).await;
                    }
                });
            }
        });

        Self {
            addr,
            audio_bytes,
            task,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Raw PCM bytes received so far across sessions.
    pub fn audio_bytes(&self) -> u64 {
        self.audio_bytes.load(Ordering::SeqCst)
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_session(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    behavior: ProviderBehavior,
    audio_bytes: Arc<AtomicU64>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut started = false;

    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => {
                let frame: serde_json::Value = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if frame["message"] == "StartRecognition" && !started {
                    started = true;
                    assert_eq!(frame["audio_format"]["encoding"], "pcm_s16le");
                    assert_eq!(frame["audio_format"]["sample_rate"], 16_000);

                    let ack = serde_json::json!({
                        "message": "RecognitionStarted",
                        "id": "mock-session-1",
                    });
                    ws.send(Message::text(ack.to_string())).await?;

                    match &behavior {
                        ProviderBehavior::Fragments(fragments) => {
                            for fragment in fragments {
                                ws.send(Message::text(fragment.to_string())).await?;
                            }
                        }
                        ProviderBehavior::ErrorAfterStart { reason } => {
                            let error = serde_json::json!({
                                "message": "Error",
                                "type": "internal_error",
                                "reason": reason,
                            });
                            ws.send(Message::text(error.to_string())).await?;
                            return Ok(());
                        }
                        ProviderBehavior::AbnormalClose => {
                            ws.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Error,
                                reason: "backend unavailable".into(),
                            })))
                            .await?;
                            return Ok(());
                        }
                    }
                }
            }
            Message::Binary(payload) => {
                if payload.is_empty() {
                    // End-of-stream sentinel: finish the transcript and
                    // close cleanly.
                    let end = serde_json::json!({ "message": "EndOfTranscript" });
                    ws.send(Message::text(end.to_string())).await?;
                    ws.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "done".into(),
                    })))
                    .await?;
                    return Ok(());
                }
                audio_bytes.fetch_add(payload.len() as u64, Ordering::SeqCst);
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}
