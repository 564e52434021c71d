//! # Live Audio Pipeline
//!
//! Runs one live voice session end to end:
//!
//! ```text
//! microphone ─► capture loop ─► encode ─► LiveSessionHandle ─► backend
//!                    │
//!                    └─► input volume ─► observer
//!
//! backend ─► on_server_audio ─► decode ─► PlaybackClock ─► output context
//!                                              │
//!                                              └─► output pulse ─► observer
//! ```
//!
//! ## Start Order:
//! output context → clock seeded at its current time → microphone → live
//! session → capture loop. A failure at any step releases whatever was already
//! acquired before the error is returned. The microphone and connect waits
//! race a cancel signal; cancelling releases the same way and returns
//! `CoreError::Cancelled`.
//!
//! ## Stop Order:
//! stop flag → capture loop → disconnect source → disconnect processor →
//! close capture → close output → close live session. Every step runs even if
//! an earlier one fails.

use crate::audio::codec::{self, bytes_to_audio_buffer, sample_rate_from_mime, INPUT_SAMPLE_RATE};
use crate::audio::device::{AudioHost, CaptureNodes, OutputContext};
use crate::audio::playback::PlaybackClock;
use crate::config::{ChatConfig, LiveConfig};
use crate::error::{CoreError, CoreResult};
use crate::session::backend::InboundAudio;
use crate::session::live::{LiveCallbacks, LiveSessionHandle};
use crate::session::SessionClient;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the pipeline reports back to the conversation layer.
pub trait LiveObserver: Send + Sync {
    /// Visualization level in [0, 1].
    fn volume(&self, level: f32);
    fn opened(&self);
    fn error(&self, message: String);
    fn closed(&self);
}

/// Input level of one capture block: RMS scaled by `gain`, clamped to 1.
pub fn block_volume(block: &[f32], gain: f32) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let mean_square = block.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / block.len() as f64;
    ((mean_square.sqrt() * gain as f64) as f32).min(1.0)
}

struct PlaybackState {
    output: Box<dyn OutputContext>,
    clock: PlaybackClock,
}

/// Session callbacks: schedules inbound audio and forwards lifecycle events.
struct PipelineCallbacks {
    stopped: Arc<AtomicBool>,
    playback: Arc<Mutex<Option<PlaybackState>>>,
    observer: Arc<dyn LiveObserver>,
    fallback_rate: u32,
    pulse_level: f32,
}

impl PipelineCallbacks {
    fn schedule(&self, audio: InboundAudio) -> CoreResult<()> {
        let rate = audio
            .mime_type
            .as_deref()
            .and_then(sample_rate_from_mime)
            .unwrap_or(self.fallback_rate);
        let bytes = codec::decode(&audio.data)?;
        let buffer = bytes_to_audio_buffer(&bytes, rate, 1)?;
        let duration = buffer.duration_secs();

        {
            let mut guard = self.playback.lock();
            let Some(state) = guard.as_mut() else {
                return Ok(());
            };
            let now = state.output.current_time();
            let chunk = state.clock.schedule(now, duration);
            state.output.play_at(buffer, chunk.start)?;
            debug!(start = chunk.start, duration, "Scheduled model audio");
        }

        // Pulse while the chunk plays
        self.observer.volume(self.pulse_level);
        let observer = Arc::clone(&self.observer);
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(duration)).await;
            if !stopped.load(Ordering::Relaxed) {
                observer.volume(0.0);
            }
        });
        Ok(())
    }
}

impl LiveCallbacks for PipelineCallbacks {
    fn on_open(&self) {
        if !self.stopped.load(Ordering::Relaxed) {
            self.observer.opened();
        }
    }

    fn on_server_audio(&self, audio: InboundAudio) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.schedule(audio) {
            warn!(error = %e, "Dropping undecodable model audio");
        }
    }

    fn on_error(&self, message: String) {
        if !self.stopped.load(Ordering::Relaxed) {
            self.observer.error(message);
        }
    }

    fn on_close(&self) {
        self.observer.closed();
    }
}

/// A running live voice session.
pub struct LivePipeline {
    client: Arc<SessionClient>,
    session: Arc<LiveSessionHandle>,
    stopped: Arc<AtomicBool>,
    playback: Arc<Mutex<Option<PlaybackState>>>,
    nodes: Box<dyn CaptureNodes>,
    capture_task: JoinHandle<()>,
}

impl LivePipeline {
    /// Acquire devices, connect the live session and start streaming.
    ///
    /// A message on (or drop of the sender of) `cancel` while waiting for the
    /// microphone or the session aborts the start.
    pub async fn start(
        host: &dyn AudioHost,
        client: Arc<SessionClient>,
        chat_config: &ChatConfig,
        live_config: &LiveConfig,
        observer: Arc<dyn LiveObserver>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> CoreResult<Self> {
        let mut output = host.open_output(live_config.output_sample_rate)?;
        let clock = PlaybackClock::new(output.current_time());

        let opened = tokio::select! {
            biased;
            _ = &mut *cancel => Err(CoreError::Cancelled),
            result = host.open_capture(INPUT_SAMPLE_RATE, live_config.capture_block_size) => result,
        };
        let capture = match opened {
            Ok(capture) => capture,
            Err(e) => {
                close_logged("output context", output.close());
                return Err(e);
            }
        };
        let mut nodes = capture.nodes;
        let mut blocks = capture.blocks;

        let stopped = Arc::new(AtomicBool::new(false));
        let playback = Arc::new(Mutex::new(Some(PlaybackState { output, clock })));
        let callbacks = Arc::new(PipelineCallbacks {
            stopped: Arc::clone(&stopped),
            playback: Arc::clone(&playback),
            observer: Arc::clone(&observer),
            fallback_rate: live_config.output_sample_rate,
            pulse_level: live_config.output_pulse_level,
        });

        let connected = tokio::select! {
            biased;
            _ = &mut *cancel => Err(CoreError::Cancelled),
            result = client.connect_live(chat_config, callbacks) => result,
        };
        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                stopped.store(true, Ordering::Relaxed);
                release_devices(nodes.as_mut(), &playback);
                return Err(e);
            }
        };

        let gain = live_config.volume_gain;
        let loop_session = Arc::clone(&session);
        let loop_stopped = Arc::clone(&stopped);
        let capture_task = tokio::spawn(async move {
            while let Some(block) = blocks.recv().await {
                if loop_stopped.load(Ordering::Relaxed) {
                    break;
                }
                observer.volume(block_volume(&block, gain));
                loop_session.send_audio_frame(codec::encode(&block));
            }
            debug!("Capture loop finished");
        });

        info!(session_id = %session.id(), "Live pipeline started");
        Ok(Self {
            client,
            session,
            stopped,
            playback,
            nodes,
            capture_task,
        })
    }

    pub fn session(&self) -> &Arc<LiveSessionHandle> {
        &self.session
    }

    /// Tear everything down. Never fails; step failures are logged.
    pub async fn stop(mut self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.capture_task.abort();
        release_devices(self.nodes.as_mut(), &self.playback);
        self.client.disconnect_live().await;
        info!(session_id = %self.session.id(), "Live pipeline stopped");
    }
}

fn close_logged(step: &str, result: CoreResult<()>) {
    if let Err(e) = result {
        warn!(step, error = %e, "Audio teardown step failed");
    }
}

/// Release capture and output resources in order, best-effort.
fn release_devices(nodes: &mut dyn CaptureNodes, playback: &Mutex<Option<PlaybackState>>) {
    close_logged("disconnect source", nodes.disconnect_source());
    close_logged("disconnect processor", nodes.disconnect_processor());
    close_logged("close capture", nodes.close());

    let state = playback.lock().take();
    match state {
        Some(mut state) => close_logged("close output", state.output.close()),
        None => close_logged(
            "close output",
            Err(CoreError::Device("output context already released".to_string())),
        ),
    }
}
