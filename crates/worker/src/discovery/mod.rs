//! Room discovery: three redundant notifiers race to claim newly
//! available rooms, de-duplicated through one short-window cache.

pub mod notify;
pub mod polling;
pub mod realtime;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use roomscribe_config::WorkerConfig;
use roomscribe_db::{Room, WorkerMode};
use roomscribe_store::{StoreGateway, CLAIM_STALE_AFTER};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which channel first triggered a successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryMethod {
    Realtime,
    Notify,
    Polling,
    Startup,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiscoveryMethod::Realtime => "realtime",
            DiscoveryMethod::Notify => "notify",
            DiscoveryMethod::Polling => "polling",
            DiscoveryMethod::Startup => "startup",
        };
        f.write_str(s)
    }
}

/// A room this worker now owns, delivered to the manager.
#[derive(Debug)]
pub struct ClaimedRoom {
    pub room: Room,
    pub method: DiscoveryMethod,
}

/// Per-room claim-attempt memory shared by all notifiers.
///
/// A room id marked in-window is skipped by the other notifiers; the
/// mark is cleared once the room's processing completes so it can be
/// legitimately re-processed later.
pub struct ClaimCache {
    window: Duration,
    entries: DashMap<Uuid, Instant>,
}

impl ClaimCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    /// Marks a claim attempt. Returns `false` when the room was already
    /// marked inside the window.
    pub fn try_mark(&self, room_id: Uuid) -> bool {
        let now = Instant::now();
        self.entries
            .retain(|_, seen| now.duration_since(*seen) < self.window);

        match self.entries.entry(room_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn clear(&self, room_id: Uuid) {
        self.entries.remove(&room_id);
    }
}

/// State shared by the three notifiers.
pub(crate) struct DiscoveryContext {
    pub(crate) store: Arc<dyn StoreGateway>,
    pub(crate) worker_id: Uuid,
    pub(crate) mode: WorkerMode,
    pub(crate) cache: Arc<ClaimCache>,
    /// The manager's single-room gate. Held through a claim attempt so
    /// the worker never owns two rooms.
    pub(crate) processing: Arc<AtomicBool>,
    pub(crate) claim_tx: mpsc::Sender<ClaimedRoom>,
}

impl DiscoveryContext {
    /// Dedup → mode filter → atomic claim → deliver.
    ///
    /// `transcription_enabled` is passed when the notifier already has the
    /// row; the notify path fetches it first.
    pub(crate) async fn try_claim(
        &self,
        room_id: Uuid,
        transcription_enabled: Option<bool>,
        method: DiscoveryMethod,
    ) -> bool {
        if self.processing.load(Ordering::SeqCst) {
            // Busy with a room; leave this one discoverable for later.
            return false;
        }

        if !self.cache.try_mark(room_id) {
            debug!(%room_id, %method, "Room in dedup window, skipping");
            return false;
        }

        let enabled = match transcription_enabled {
            Some(enabled) => enabled,
            None => match self.store.get_room(room_id).await {
                Ok(Some(room)) => room.transcription_enabled,
                Ok(None) => {
                    self.cache.clear(room_id);
                    return false;
                }
                Err(e) => {
                    warn!(%room_id, error = %e, "Room fetch before claim failed");
                    self.cache.clear(room_id);
                    return false;
                }
            },
        };

        if !self.mode.accepts_room(enabled) {
            // Not an attempt; other modes may still want this room.
            self.cache.clear(room_id);
            return false;
        }

        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.cache.clear(room_id);
            return false;
        }

        let claimed = match self.store.claim_room(self.worker_id, room_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(%room_id, error = %e, "Claim attempt failed");
                false
            }
        };

        if !claimed {
            // Lost the race; the cache mark still suppresses re-attempts
            // for the window.
            self.processing.store(false, Ordering::SeqCst);
            debug!(%room_id, %method, "Claim lost");
            return false;
        }

        let room = match self.store.get_room(room_id).await {
            Ok(Some(room)) => room,
            other => {
                warn!(%room_id, ?other, "Claimed room vanished, releasing");
                let _ = self.store.release_room(self.worker_id, room_id).await;
                self.processing.store(false, Ordering::SeqCst);
                return false;
            }
        };

        info!(%room_id, %method, "Room claimed");
        if self
            .claim_tx
            .send(ClaimedRoom { room, method })
            .await
            .is_err()
        {
            let _ = self.store.release_room(self.worker_id, room_id).await;
            self.processing.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }
}

/// Owns the notifier tasks for one worker.
pub struct RoomDiscovery {
    ctx: Arc<DiscoveryContext>,
    poll_now: Arc<Notify>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RoomDiscovery {
    pub fn start(
        config: &WorkerConfig,
        store: Arc<dyn StoreGateway>,
        processing: Arc<AtomicBool>,
        claim_tx: mpsc::Sender<ClaimedRoom>,
        parent: &CancellationToken,
    ) -> Self {
        let cache = Arc::new(ClaimCache::new(config.claim_cache_duration));
        let ctx = Arc::new(DiscoveryContext {
            store,
            worker_id: config.worker_id,
            mode: config.mode,
            cache,
            processing,
            claim_tx,
        });

        let cancel = parent.child_token();
        let poll_now = Arc::new(Notify::new());
        let mut tasks = Vec::new();

        if config.enable_polling_fallback {
            tasks.push(tokio::spawn(polling::run(
                Arc::clone(&ctx),
                config.polling_interval,
                Arc::clone(&poll_now),
                cancel.clone(),
            )));
        }

        match (&config.store_direct_url, config.enable_database_notify) {
            (Some(url), true) => {
                tasks.push(tokio::spawn(notify::run(
                    Arc::clone(&ctx),
                    url.clone(),
                    cancel.clone(),
                )));
            }
            _ => info!("Database notify channel disabled"),
        }

        match &config.store_realtime_url {
            Some(url) => {
                tasks.push(tokio::spawn(realtime::run(
                    Arc::clone(&ctx),
                    url.clone(),
                    config.store_service_key.clone(),
                    config.realtime_timeout,
                    config.realtime_retry_interval,
                    cancel.clone(),
                )));
            }
            None => info!("Realtime change stream disabled"),
        }

        Self {
            ctx,
            poll_now,
            cancel,
            tasks,
        }
    }

    /// One immediate claim sweep, used right after registration so a
    /// restarted worker picks up backlog without waiting for a tick.
    pub async fn startup_sweep(&self) {
        polling::poll_once(&self.ctx, DiscoveryMethod::Startup).await;
    }

    /// Ask the polling notifier to look immediately (called after a room
    /// is released).
    pub fn check_now(&self) {
        self.poll_now.notify_one();
    }

    /// Forgets a processed room so it can be claimed again later.
    pub fn clear_room(&self, room_id: Uuid) {
        self.ctx.cache.clear(room_id);
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Default staleness threshold used by the notifiers' claimable queries.
pub(crate) fn stale_threshold() -> Duration {
    CLAIM_STALE_AFTER
}
