use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Signal delivered exactly once per detector instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEnd;

/// Fires once after the room has stayed empty for the configured window.
///
/// `update(0)` arms the timer; any `update(>0)` before it fires cancels
/// it. Re-arming after a fire requires a fresh detector (a new room).
pub struct CallEndDetector {
    empty_timeout: Duration,
    fire_tx: mpsc::Sender<CallEnd>,
    fired: Arc<AtomicBool>,
    timer: Option<AbortHandle>,
    count: usize,
}

impl CallEndDetector {
    /// Returns the detector and the channel the owner listens on.
    pub fn new(empty_timeout: Duration) -> (Self, mpsc::Receiver<CallEnd>) {
        let (fire_tx, fire_rx) = mpsc::channel(1);
        (
            Self {
                empty_timeout,
                fire_tx,
                fired: Arc::new(AtomicBool::new(false)),
                timer: None,
                count: 0,
            },
            fire_rx,
        )
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Feeds the current participant count.
    pub fn update(&mut self, count: usize) {
        self.count = count;
        if self.fired.load(Ordering::SeqCst) {
            return;
        }

        if count == 0 {
            if self.timer.is_none() {
                debug!(timeout_secs = self.empty_timeout.as_secs(), "Room empty, arming call-end timer");
                self.arm();
            }
        } else if let Some(timer) = self.timer.take() {
            debug!(count, "Participant returned, call-end timer cancelled");
            timer.abort();
        }
    }

    /// Cancels any pending timer and fires immediately (at most once).
    pub fn force(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if !self.fired.swap(true, Ordering::SeqCst) {
            info!("Call end forced");
            let _ = self.fire_tx.try_send(CallEnd);
        }
    }

    fn arm(&mut self) {
        let fired = Arc::clone(&self.fired);
        let fire_tx = self.fire_tx.clone();
        let timeout = self.empty_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !fired.swap(true, Ordering::SeqCst) {
                info!(timeout_secs = timeout.as_secs(), "Empty-room window elapsed, ending call");
                let _ = fire_tx.try_send(CallEnd);
            }
        });
        self.timer = Some(handle.abort_handle());
    }
}

impl Drop for CallEndDetector {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
