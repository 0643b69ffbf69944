//! Post-call analysis driver: polls the work queue and calls the
//! configured LLM endpoint. Peripheral to the transcription core; it only
//! consumes persisted rows.

use std::sync::Arc;
use std::time::Duration;

use roomscribe_db::{AnalysisJob, TranscriptRow};
use roomscribe_store::{StoreError, StoreGateway};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MISSING_CONFIG_BACKOFF: Duration = Duration::from_secs(30);
const LLM_TIMEOUT: Duration = Duration::from_secs(120);

struct LlmSettings {
    endpoint: String,
    api_key: String,
    model: String,
}

/// Independent pool that drains `analysis_jobs`.
pub struct AiJobsDriver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AiJobsDriver {
    pub fn start(store: Arc<dyn StoreGateway>, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let task = tokio::spawn(run(store, cancel.clone()));
        Self { cancel, task }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(store: Arc<dyn StoreGateway>, cancel: CancellationToken) {
    info!("AI jobs driver started");
    let http = reqwest::Client::new();

    loop {
        let wait = match tick(&store, &http).await {
            Ok(worked) => {
                if worked {
                    // Drain the queue without waiting between jobs.
                    Duration::ZERO
                } else {
                    POLL_INTERVAL
                }
            }
            Err(StoreError::MissingConfig(what)) => {
                warn!(%what, "AI jobs paused on missing configuration");
                MISSING_CONFIG_BACKOFF
            }
            Err(e) => {
                warn!(error = %e, "AI jobs poll failed");
                POLL_INTERVAL
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("AI jobs driver stopped");
}

/// Claims and runs at most one job. Returns whether a job was processed.
async fn tick(store: &Arc<dyn StoreGateway>, http: &reqwest::Client) -> Result<bool, StoreError> {
    let Some(job) = store.claim_next_job().await? else {
        return Ok(false);
    };

    let settings = load_settings(store).await?;
    debug!(job_id = %job.id, job_type = %job.job_type, room_id = %job.room_id, "Running analysis job");

    let transcripts = store.fetch_room_transcripts(job.room_id).await?;
    let outcome = match run_llm(http, &settings, &job, &transcripts).await {
        Ok(result) => Ok(serde_json::json!({
            "job_type": job.job_type,
            "content": result,
        })),
        Err(message) => {
            warn!(job_id = %job.id, %message, "Analysis job failed");
            Err(message)
        }
    };

    store.finish_job(job.id, outcome).await?;
    Ok(true)
}

async fn load_settings(store: &Arc<dyn StoreGateway>) -> Result<LlmSettings, StoreError> {
    let endpoint = store
        .get_service_setting("llm_endpoint")
        .await?
        .ok_or_else(|| StoreError::MissingConfig("service setting 'llm_endpoint'".into()))?;
    let api_key = store
        .get_service_setting("llm_api_key")
        .await?
        .ok_or_else(|| StoreError::MissingConfig("service setting 'llm_api_key'".into()))?;
    let model = store
        .get_service_setting("llm_model")
        .await?
        .ok_or_else(|| StoreError::MissingConfig("service setting 'llm_model'".into()))?;
    Ok(LlmSettings {
        endpoint,
        api_key,
        model,
    })
}

async fn run_llm(
    http: &reqwest::Client,
    settings: &LlmSettings,
    job: &AnalysisJob,
    transcripts: &[TranscriptRow],
) -> Result<String, String> {
    if transcripts.is_empty() {
        return Err("no transcript rows for room".to_string());
    }

    let body = serde_json::json!({
        "model": settings.model,
        "messages": [
            { "role": "system", "content": system_prompt(&job.job_type) },
            { "role": "user", "content": render_transcript(transcripts) },
        ],
    });

    let response = http
        .post(&settings.endpoint)
        .bearer_auth(&settings.api_key)
        .timeout(LLM_TIMEOUT)
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("llm request failed: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("llm returned status {}", response.status()));
    }

    let payload: serde_json::Value = response
        .json()
        .await
        .map_err(|e| format!("llm response decode failed: {e}"))?;

    payload["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| "llm response missing content".to_string())
}

fn system_prompt(job_type: &str) -> String {
    let instruction = match job_type {
        "summary" => "Write a concise summary of this call transcript.",
        "action_items" => "List the action items agreed in this call, one per line.",
        "sentiment" => "Describe the overall sentiment of this call and any notable shifts.",
        "speaker_analytics" => {
            "Report per-speaker talk share and notable interaction patterns in this call."
        }
        other => return format!("Perform the '{other}' analysis on this call transcript."),
    };
    instruction.to_string()
}

/// Timeline rendering: rows are already ordered by relative timestamp.
fn render_transcript(rows: &[TranscriptRow]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!(
            "[{:.1}s] {}: {}\n",
            row.relative_timestamp_seconds, row.participant_id, row.text
        ));
    }
    out
}
