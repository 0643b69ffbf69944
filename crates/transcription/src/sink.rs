use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use roomscribe_store::{NewTranscript, StoreError, StoreGateway, Timebase, TimebaseError};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TranscriptionConfig;

/// A finalized utterance waiting for the batch insert.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub stt_session_id: Uuid,
    pub participant_id: Uuid,
    pub text: String,
    pub is_final: bool,
    pub confidence: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub language: Option<String>,
    /// Captured when the utterance was flushed out of the aggregator.
    pub wall_clock_timestamp: DateTime<Utc>,
}

struct QueueState {
    queue: VecDeque<PendingRow>,
    /// Lazily loaded once per room: `None` = not loaded yet.
    organization: Option<Option<Uuid>>,
}

struct Shared {
    store: Arc<dyn StoreGateway>,
    room_id: Uuid,
    origin: DateTime<Utc>,
    batch_size: usize,
    queue_cap: usize,
    state: Mutex<QueueState>,
    size_trigger: Notify,
    dropped: AtomicU64,
    flushed: AtomicU64,
}

/// Bounded, time- and size-triggered batch writer for transcript rows.
///
/// Lossy on overflow: beyond the cap the oldest pending row is shed and
/// counted. A failed insert puts the batch back only if it still fits.
pub struct TranscriptSink {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptSink {
    /// The timebase must be initialized; rows are relativized to its origin
    /// at flush time.
    pub fn new(
        store: Arc<dyn StoreGateway>,
        room_id: Uuid,
        timebase: &Timebase,
        config: &TranscriptionConfig,
        parent: &CancellationToken,
    ) -> Result<Self, TimebaseError> {
        let origin = timebase.origin().ok_or(TimebaseError)?;

        let shared = Arc::new(Shared {
            store,
            room_id,
            origin,
            batch_size: config.batch_size.max(1),
            queue_cap: config.queue_cap.max(1),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                organization: None,
            }),
            size_trigger: Notify::new(),
            dropped: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        });

        let cancel = parent.child_token();
        let flusher = tokio::spawn(flusher_loop(
            Arc::clone(&shared),
            config.batch_interval,
            cancel.clone(),
        ));

        Ok(Self {
            shared,
            cancel,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Queues a finalized row. Non-final rows are ignored; beyond the cap
    /// the oldest pending row is dropped with accounting. Never blocks.
    pub async fn enqueue(&self, row: PendingRow) {
        if !row.is_final {
            return;
        }

        let notify = {
            let mut state = self.shared.state.lock().await;
            state.queue.push_back(row);
            if state.queue.len() > self.shared.queue_cap {
                state.queue.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    room_id = %self.shared.room_id,
                    dropped,
                    "Transcript queue full, dropped oldest pending row"
                );
            }
            state.queue.len() >= self.shared.batch_size
        };

        if notify {
            self.shared.size_trigger.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        // Best effort: only used for logging and tests.
        match self.shared.state.try_lock() {
            Ok(state) => state.queue.len(),
            Err(_) => 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.shared.flushed.load(Ordering::Relaxed)
    }

    /// Stops the background flusher and flushes whatever is pending.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.flusher.lock().await.take() {
            let _ = handle.await;
        }
        if let Err(e) = self.shared.flush_all().await {
            error!(room_id = %self.shared.room_id, error = %e, "Final transcript flush failed");
        }
        info!(
            room_id = %self.shared.room_id,
            flushed = self.flushed(),
            dropped = self.dropped(),
            "Transcript sink stopped"
        );
    }
}

async fn flusher_loop(shared: Arc<Shared>, interval: std::time::Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.size_trigger.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = shared.flush_all().await {
            debug!(room_id = %shared.room_id, error = %e, "Transcript flush failed, batch requeued or shed");
        }
    }
}

impl Shared {
    /// Drains the queue in insert-sized batches.
    async fn flush_all(&self) -> Result<(), StoreError> {
        loop {
            let batch: Vec<PendingRow> = {
                let mut state = self.state.lock().await;
                let n = state.queue.len().min(self.batch_size);
                state.queue.drain(..n).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }

            if let Err(e) = self.insert_batch(&batch).await {
                self.requeue(batch).await;
                return Err(e);
            }
        }
    }

    async fn insert_batch(&self, batch: &[PendingRow]) -> Result<(), StoreError> {
        let organization = self.organization().await?;

        let rows: Vec<NewTranscript> = batch
            .iter()
            .map(|row| NewTranscript {
                room_id: self.room_id,
                stt_session_id: row.stt_session_id,
                participant_id: row.participant_id,
                text: row.text.clone(),
                confidence: row.confidence,
                relative_timestamp_seconds: relative_seconds(self.origin, row.wall_clock_timestamp),
                start_time: row.start_time,
                end_time: row.end_time,
                language: row.language.clone(),
                wall_clock_timestamp: row.wall_clock_timestamp,
                organization_id: organization,
            })
            .collect();

        self.store.insert_transcripts(&rows).await?;
        self.flushed.fetch_add(rows.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn organization(&self) -> Result<Option<Uuid>, StoreError> {
        if let Some(cached) = self.state.lock().await.organization {
            return Ok(cached);
        }
        let organization = self
            .store
            .get_room(self.room_id)
            .await?
            .and_then(|room| room.organization_id);
        self.state.lock().await.organization = Some(organization);
        Ok(organization)
    }

    /// Puts a failed batch back at the head, unless that would overflow
    /// the cap, in which case the batch is shed with accounting.
    async fn requeue(&self, batch: Vec<PendingRow>) {
        let mut state = self.state.lock().await;
        if state.queue.len() + batch.len() <= self.queue_cap {
            for row in batch.into_iter().rev() {
                state.queue.push_front(row);
            }
        } else {
            let shed = batch.len() as u64;
            self.dropped.fetch_add(shed, Ordering::Relaxed);
            error!(
                room_id = %self.room_id,
                shed,
                "Failed batch does not fit back into the queue, shedding"
            );
        }
    }
}

fn relative_seconds(origin: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (at - origin).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}
