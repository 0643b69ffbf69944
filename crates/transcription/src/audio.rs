use roomscribe_conference::AudioFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stt::AudioLane;

/// Initial down-mix buffer size: ~300 ms at 16 kHz.
const INITIAL_DOWNMIX_SAMPLES: usize = 4_800;

/// Per-track producer: pulls frames off the conferencing subscription,
/// converts to 16-bit mono PCM and forwards into the matching STT lane.
///
/// Exits when the frame stream ends or `stop()` is called; the down-mix
/// buffer lives inside the task, so teardown frees it.
pub struct AudioPump {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl AudioPump {
    pub fn spawn(
        frames: mpsc::Receiver<AudioFrame>,
        lane: AudioLane,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let handle = tokio::spawn(pump_loop(frames, lane, cancel.clone()));
        Self { handle, cancel }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn pump_loop(
    mut frames: mpsc::Receiver<AudioFrame>,
    lane: AudioLane,
    cancel: CancellationToken,
) {
    // Reused across frames; grows to the largest frame seen.
    let mut mono = Vec::<i16>::with_capacity(INITIAL_DOWNMIX_SAMPLES);
    let mut frame_count: u64 = 0;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        frame_count += 1;

        let samples: &[i16] = match frame.channels {
            0 => {
                debug!("Audio frame with zero channels, skipping");
                continue;
            }
            1 => &frame.samples,
            2 => {
                mono.clear();
                mono.extend(
                    frame
                        .samples
                        .chunks_exact(2)
                        .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16),
                );
                &mono
            }
            n => {
                // Unusual layouts: keep the first channel.
                mono.clear();
                mono.extend(frame.samples.iter().step_by(n as usize).copied());
                &mono
            }
        };

        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        lane.send_audio(pcm);
    }

    debug!(frame_count, "Audio pump exiting");
}
