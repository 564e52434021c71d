//! # cpal Audio Host
//!
//! Real microphone and speaker access through cpal.
//!
//! `cpal::Stream` is not `Send` on every platform, so each stream lives on its
//! own OS thread for its whole life. The async side talks to that thread
//! through channels and shared state:
//!
//! - **Output**: a sample timeline indexed by frames played. `play_at` mixes a
//!   buffer into the timeline at the requested start frame; the device
//!   callback pops one frame per tick and advances the clock.
//! - **Capture**: the device callback downmixes to mono, resamples to the
//!   requested rate and emits fixed-size blocks through a tokio channel.

use crate::audio::codec::PcmBuffer;
use crate::audio::device::{AudioHost, CaptureGraph, CaptureNodes, OutputContext, CAPTURE_CHANNEL_CAPACITY};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Longest time a closing output context keeps playing already scheduled audio.
const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Audio host backed by the platform's default input and output devices.
#[derive(Debug, Clone, Default)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

/// Map cpal's error text onto the core error taxonomy.
fn device_error(context: &str, err: impl std::fmt::Display) -> CoreError {
    let message = format!("{}: {}", context, err);
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") || lower.contains("not authorized") {
        CoreError::PermissionDenied(message)
    } else {
        CoreError::Device(message)
    }
}

/// Linear interpolation resampler for mono samples.
fn resample(mono: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || mono.is_empty() {
        return mono.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (mono.len() as f64 / ratio).ceil() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = i as f64 * ratio;
        let idx0 = (src.floor() as usize).min(mono.len() - 1);
        let idx1 = (idx0 + 1).min(mono.len() - 1);
        let frac = (src - idx0 as f64) as f32;
        out.push(mono[idx0] * (1.0 - frac) + mono[idx1] * frac);
    }
    out
}

/// Average interleaved frames down to one channel.
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

// =============================================================================
// Output
// =============================================================================

/// Mono samples still to be played, starting at frame `base`.
#[derive(Default)]
struct Timeline {
    base: u64,
    samples: VecDeque<f32>,
}

impl Timeline {
    fn mix_at(&mut self, start_frame: u64, samples: &[f32]) {
        // Chunks scheduled into the past start at the current frame
        let offset = start_frame.saturating_sub(self.base) as usize;
        let needed = offset + samples.len();
        if self.samples.len() < needed {
            self.samples.resize(needed, 0.0);
        }
        for (i, sample) in samples.iter().enumerate() {
            self.samples[offset + i] += sample;
        }
    }

    fn next(&mut self) -> f32 {
        self.base += 1;
        self.samples.pop_front().unwrap_or(0.0).clamp(-1.0, 1.0)
    }
}

struct CpalOutput {
    device_rate: u32,
    frames_played: Arc<AtomicU64>,
    timeline: Arc<Mutex<Timeline>>,
    shutdown: Option<std_mpsc::Sender<()>>,
}

impl OutputContext for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Relaxed) as f64 / self.device_rate as f64
    }

    fn play_at(&mut self, buffer: PcmBuffer, start: f64) -> CoreResult<()> {
        if self.shutdown.is_none() {
            return Err(CoreError::Device("output context is closed".to_string()));
        }
        let mono = downmix(&buffer.interleaved(), buffer.channels.len());
        let samples = resample(&mono, buffer.sample_rate, self.device_rate);
        let start_frame = (start.max(0.0) * self.device_rate as f64).round() as u64;
        self.timeline.lock().mix_at(start_frame, &samples);
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        match self.shutdown.take() {
            Some(tx) => tx
                .send(())
                .map_err(|_| CoreError::Device("output thread already exited".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_output_thread(
    ready: std_mpsc::Sender<CoreResult<u32>>,
    shutdown: std_mpsc::Receiver<()>,
    frames_played: Arc<AtomicU64>,
    timeline: Arc<Mutex<Timeline>>,
) {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(device) => device,
        None => {
            let _ = ready.send(Err(CoreError::Device("no default output device".to_string())));
            return;
        }
    };

    let supported = match device.default_output_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(device_error("failed to query output config", e)));
            return;
        }
    };
    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let stream_config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let callback_timeline = Arc::clone(&timeline);
    let callback_frames = Arc::clone(&frames_played);
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut timeline = callback_timeline.lock();
            for frame in data.chunks_mut(channels) {
                let sample = timeline.next();
                frame.fill(sample);
            }
            callback_frames.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
        },
        |err| error!(error = %err, "Output stream error"),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(device_error("failed to build output stream", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(device_error("failed to start output stream", e)));
        return;
    }

    info!(device_rate, channels, "Output stream started");
    let _ = ready.send(Ok(device_rate));

    // Either an explicit close or the context being dropped ends the wait
    let _ = shutdown.recv();

    let drain_started = Instant::now();
    while !timeline.lock().samples.is_empty() && drain_started.elapsed() < OUTPUT_DRAIN_LIMIT {
        thread::sleep(Duration::from_millis(20));
    }
    drop(stream);
    debug!("Output stream closed");
}

// =============================================================================
// Capture
// =============================================================================

struct CpalCapture {
    source_connected: Arc<AtomicBool>,
    processor: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
    shutdown: Option<std_mpsc::Sender<()>>,
}

impl CaptureNodes for CpalCapture {
    fn disconnect_source(&mut self) -> CoreResult<()> {
        self.source_connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn disconnect_processor(&mut self) -> CoreResult<()> {
        self.processor.lock().take();
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        match self.shutdown.take() {
            Some(tx) => tx
                .send(())
                .map_err(|_| CoreError::Device("capture thread already exited".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct CaptureParams {
    target_rate: u32,
    block_size: usize,
    source_connected: Arc<AtomicBool>,
    processor: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
}

fn run_capture_thread(
    params: CaptureParams,
    ready: oneshot::Sender<CoreResult<()>>,
    shutdown: std_mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(device) => device,
        None => {
            let _ = ready.send(Err(CoreError::Device("no default input device".to_string())));
            return;
        }
    };

    let supported = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(device_error("failed to query input config", e)));
            return;
        }
    };
    let device_rate = supported.sample_rate().0;
    let device_channels = supported.channels() as usize;
    let stream_config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let CaptureParams {
        target_rate,
        block_size,
        source_connected,
        processor,
    } = params;

    let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if !source_connected.load(Ordering::Relaxed) {
                return;
            }
            let mono = downmix(data, device_channels);
            pending.extend(resample(&mono, device_rate, target_rate));

            let guard = processor.lock();
            let Some(tx) = guard.as_ref() else {
                pending.clear();
                return;
            };
            while pending.len() >= block_size {
                let block: Vec<f32> = pending.drain(..block_size).collect();
                // The consumer is real-time; a full channel means the block is stale
                if tx.try_send(block).is_err() {
                    warn!("Capture consumer is behind, dropping block");
                }
            }
        },
        |err| error!(error = %err, "Input stream error"),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(device_error("failed to open microphone", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(device_error("failed to start microphone", e)));
        return;
    }

    info!(device_rate, device_channels, target_rate, block_size, "Capture stream started");
    let _ = ready.send(Ok(()));

    let _ = shutdown.recv();
    drop(stream);
    debug!("Capture stream closed");
}

#[async_trait]
impl AudioHost for CpalHost {
    fn open_output(&self, sample_rate: u32) -> CoreResult<Box<dyn OutputContext>> {
        let frames_played = Arc::new(AtomicU64::new(0));
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel();

        let thread_frames = Arc::clone(&frames_played);
        let thread_timeline = Arc::clone(&timeline);
        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || run_output_thread(ready_tx, shutdown_rx, thread_frames, thread_timeline))
            .map_err(|e| CoreError::Device(format!("failed to spawn output thread: {}", e)))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| CoreError::Device("output thread exited during startup".to_string()))??;

        debug!(requested_rate = sample_rate, device_rate, "Output context opened");
        Ok(Box::new(CpalOutput {
            device_rate,
            frames_played,
            timeline,
            shutdown: Some(shutdown_tx),
        }))
    }

    async fn open_capture(&self, sample_rate: u32, block_size: usize) -> CoreResult<CaptureGraph> {
        if sample_rate == 0 || block_size == 0 {
            return Err(CoreError::Device(format!(
                "invalid capture format: {} Hz, {} samples per block",
                sample_rate, block_size
            )));
        }

        let (blocks_tx, blocks_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let source_connected = Arc::new(AtomicBool::new(true));
        let processor = Arc::new(Mutex::new(Some(blocks_tx)));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel();

        let params = CaptureParams {
            target_rate: sample_rate,
            block_size,
            source_connected: Arc::clone(&source_connected),
            processor: Arc::clone(&processor),
        };
        thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture_thread(params, ready_tx, shutdown_rx))
            .map_err(|e| CoreError::Device(format!("failed to spawn capture thread: {}", e)))?;

        // Permission prompts resolve here
        ready_rx
            .await
            .map_err(|_| CoreError::Device("capture thread exited during startup".to_string()))??;

        Ok(CaptureGraph {
            blocks: blocks_rx,
            nodes: Box::new(CpalCapture {
                source_connected,
                processor,
                shutdown: Some(shutdown_tx),
            }),
        })
    }
}
