//! Generative backend port.
//!
//! The session client only knows these traits. `GeminiBackend` implements them
//! against the Gemini REST and Live APIs; tests use in-memory fakes.

use crate::audio::codec::WireFrame;
use crate::config::ChatConfig;
use crate::error::CoreResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Audio pushed by the server during a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudio {
    /// Base64 16-bit PCM
    pub data: String,
    /// e.g. `audio/pcm;rate=24000`, when the server declares it
    pub mime_type: Option<String>,
}

/// Raw events a live transport reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// Setup acknowledged; audio may flow
    Open,
    Audio(InboundAudio),
    Error(String),
    Closed,
}

/// Entry point to a generative AI provider.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Create a multi-turn chat configured by `config`. Never fails; transport
    /// problems surface on the first message.
    fn create_streaming_chat(&self, config: &ChatConfig) -> Arc<dyn ChatTransport>;

    /// Connect a live audio session. Events are reported through `events`
    /// until the transport is closed; the transport ends by sending `Closed`
    /// or dropping the sender.
    async fn open_live_session(
        &self,
        config: &ChatConfig,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> CoreResult<Box<dyn LiveTransport>>;
}

/// One chat session on the provider.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a user message; the receiver yields text deltas and ends with the
    /// turn. A failure mid-turn arrives as an `Err` item after the deltas that
    /// were already produced.
    async fn send_message_stream(&self, text: &str) -> CoreResult<mpsc::Receiver<CoreResult<String>>>;
}

/// Upstream half of a live session.
pub trait LiveTransport: Send + Sync {
    /// Queue one audio frame without waiting for the network.
    fn send_audio(&self, frame: WireFrame) -> CoreResult<()>;

    /// Close the connection. Idempotent.
    fn close(&self);
}
