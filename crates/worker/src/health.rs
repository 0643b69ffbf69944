use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use roomscribe_db::WorkerMode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct HealthState {
    worker_id: Uuid,
    mode: WorkerMode,
}

/// Optional liveness endpoint: `GET /health`, everything else 404.
pub async fn serve(port: u16, worker_id: Uuid, mode: WorkerMode, cancel: CancellationToken) {
    let state = HealthState { worker_id, mode };
    let app = Router::new()
        .route("/health", get(health))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "Health endpoint bind failed");
            return;
        }
    };

    info!(port, "Health endpoint listening");
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await });
    if let Err(e) = server.await {
        warn!(error = %e, "Health endpoint exited");
    }
}

async fn health(State(state): State<HealthState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "workerId": state.worker_id,
        "mode": state.mode.to_string(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
