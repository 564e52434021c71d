//! # Audio Module
//!
//! Everything the live voice session needs between the microphone, the
//! speakers and the network.
//!
//! ## Key Components:
//! - **Codec**: Float samples <-> base64 16-bit PCM wire frames
//! - **Playback**: Gapless scheduling of inbound chunks on the output clock
//! - **Device**: The platform seam (capture graph, output context) and a headless host
//! - **Pipeline**: Ties capture, session and playback together for one live session
//!
//! ## Audio Format:
//! - **Input**: 16kHz mono, sent upstream as `audio/pcm;rate=16000`
//! - **Output**: 24kHz mono unless the server declares another rate
//! - **Encoding**: Little-endian signed 16-bit integers

pub mod codec;      // PCM wire format
pub mod device;     // Audio host abstraction + NullHost
pub mod pipeline;   // Live audio pipeline
pub mod playback;   // PlaybackClock

#[cfg(feature = "cpal-host")]
pub mod cpal_host;  // Real devices through cpal
