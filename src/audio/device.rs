//! # Audio Devices
//!
//! The live pipeline talks to the microphone and speakers through the traits in
//! this module, so the same pipeline runs on real hardware (`CpalHost`, behind
//! the `cpal-host` feature), headless (`NullHost`) and in tests.
//!
//! ## Key Types:
//! - **AudioHost**: Opens output contexts and capture graphs
//! - **OutputContext**: Monotonic playback clock plus "play this buffer at t"
//! - **CaptureGraph**: A stream of fixed-size sample blocks and the nodes to tear down
//!
//! ## Teardown Contract:
//! Every method that releases a resource returns a `CoreResult`. Callers tear
//! down best-effort: a failing step is logged and the next one still runs.

use crate::audio::codec::PcmBuffer;
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Blocks buffered between the capture callback and the capture loop.
pub const CAPTURE_CHANNEL_CAPACITY: usize = 16;

/// Factory for the platform's audio resources.
#[async_trait]
pub trait AudioHost: Send + Sync {
    /// Open an output context whose clock starts now.
    fn open_output(&self, sample_rate: u32) -> CoreResult<Box<dyn OutputContext>>;

    /// Acquire the microphone and deliver mono blocks of `block_size` samples.
    ///
    /// Waits for microphone permission; a refusal is `CoreError::PermissionDenied`.
    async fn open_capture(&self, sample_rate: u32, block_size: usize) -> CoreResult<CaptureGraph>;
}

/// Playback side of a live session.
pub trait OutputContext: Send {
    /// Seconds since the context was opened. Monotonic.
    fn current_time(&self) -> f64;

    /// Queue a buffer to start at `start` (output-clock seconds).
    fn play_at(&mut self, buffer: PcmBuffer, start: f64) -> CoreResult<()>;

    /// Release the context.
    fn close(&mut self) -> CoreResult<()>;
}

/// The resources behind a capture graph, released in declaration order.
pub trait CaptureNodes: Send {
    /// Detach the microphone from the processing node.
    fn disconnect_source(&mut self) -> CoreResult<()>;

    /// Stop the processing node; the block stream ends.
    fn disconnect_processor(&mut self) -> CoreResult<()>;

    /// Release the capture context and the device.
    fn close(&mut self) -> CoreResult<()>;
}

/// An acquired microphone.
pub struct CaptureGraph {
    pub blocks: mpsc::Receiver<Vec<f32>>,
    pub nodes: Box<dyn CaptureNodes>,
}

/// Headless host: silent microphone, clock-only speakers.
///
/// Useful for servers without sound hardware. The capture graph still produces
/// blocks at real-time cadence so the rest of the pipeline behaves normally.
#[derive(Debug, Clone, Default)]
pub struct NullHost;

impl NullHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioHost for NullHost {
    fn open_output(&self, sample_rate: u32) -> CoreResult<Box<dyn OutputContext>> {
        debug!(sample_rate, "Opening null output context");
        Ok(Box::new(NullOutput {
            origin: Instant::now(),
            closed: false,
        }))
    }

    async fn open_capture(&self, sample_rate: u32, block_size: usize) -> CoreResult<CaptureGraph> {
        if sample_rate == 0 || block_size == 0 {
            return Err(CoreError::Device(format!(
                "invalid capture format: {} Hz, {} samples per block",
                sample_rate, block_size
            )));
        }

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let stopped = Arc::new(AtomicBool::new(false));
        let block_period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);

        let task_stopped = Arc::clone(&stopped);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(block_period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if task_stopped.load(Ordering::Relaxed) {
                    break;
                }
                if tx.send(vec![0.0; block_size]).await.is_err() {
                    break;
                }
            }
            debug!("Null capture stopped");
        });

        info!(sample_rate, block_size, "Null capture opened");
        Ok(CaptureGraph {
            blocks: rx,
            nodes: Box::new(NullCapture { stopped }),
        })
    }
}

struct NullOutput {
    origin: Instant,
    closed: bool,
}

impl OutputContext for NullOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn play_at(&mut self, buffer: PcmBuffer, start: f64) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::Device("output context is closed".to_string()));
        }
        debug!(
            start,
            duration = buffer.duration_secs(),
            "Null output discarding scheduled chunk"
        );
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        self.closed = true;
        Ok(())
    }
}

struct NullCapture {
    stopped: Arc<AtomicBool>,
}

impl CaptureNodes for NullCapture {
    fn disconnect_source(&mut self) -> CoreResult<()> {
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn disconnect_processor(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_null_capture_delivers_blocks_until_disconnected() {
        let host = NullHost::new();
        let mut graph = host.open_capture(16_000, 4096).await.unwrap();

        let block = graph.blocks.recv().await.unwrap();
        assert_eq!(block.len(), 4096);
        assert!(block.iter().all(|s| *s == 0.0));

        graph.nodes.disconnect_source().unwrap();
        // At most one block that was already in flight, then the stream ends
        let mut remaining = 0;
        while graph.blocks.recv().await.is_some() {
            remaining += 1;
        }
        assert!(remaining <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_output_clock_is_monotonic() {
        let host = NullHost::new();
        let mut output = host.open_output(24_000).unwrap();
        let t0 = output.current_time();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let t1 = output.current_time();
        assert!(t1 >= t0 + 0.25);

        output.close().unwrap();
        let buffer = PcmBuffer {
            sample_rate: 24_000,
            channels: vec![vec![0.0; 10]],
        };
        assert!(output.play_at(buffer, t1).is_err());
    }

    #[tokio::test]
    async fn test_null_capture_rejects_invalid_format() {
        let host = NullHost::new();
        assert!(matches!(
            host.open_capture(16_000, 0).await,
            Err(CoreError::Device(_))
        ));
    }
}
