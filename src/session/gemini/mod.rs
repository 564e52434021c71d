//! # Gemini Backend
//!
//! `GenerativeBackend` implementation for the Gemini API.
//!
//! ## Key Components:
//! - **GeminiChat**: REST streaming chat with client-side history
//! - **GeminiLive**: Live API WebSocket carrying realtime PCM both ways
//! - **protocol / sse**: Wire payloads and the SSE line decoder

pub mod chat;
pub mod live;
pub mod protocol;
pub mod sse;

use crate::config::{BackendConfig, ChatConfig};
use crate::error::CoreResult;
use crate::session::backend::{ChatTransport, GenerativeBackend, LiveEvent, LiveTransport};
use async_trait::async_trait;
use chat::GeminiChat;
use protocol::SetupMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

pub struct GeminiBackend {
    http: reqwest::Client,
    config: BackendConfig,
}

impl GeminiBackend {
    pub fn new(config: BackendConfig) -> CoreResult<Self> {
        if config.api_key.is_empty() {
            warn!("No Gemini API key configured; requests will be rejected upstream");
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    fn create_streaming_chat(&self, config: &ChatConfig) -> Arc<dyn ChatTransport> {
        Arc::new(GeminiChat::new(
            self.http.clone(),
            &self.config.api_base_url,
            &self.config.api_key,
            Duration::from_secs(self.config.request_timeout_secs),
            config,
        ))
    }

    async fn open_live_session(
        &self,
        config: &ChatConfig,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> CoreResult<Box<dyn LiveTransport>> {
        let setup = SetupMessage::audio(
            &self.config.live_model,
            &self.config.voice_name,
            &config.system_instruction,
        );
        let transport = live::connect(
            &self.config.live_url,
            &self.config.api_key,
            setup,
            Duration::from_secs(self.config.request_timeout_secs),
            events,
        )
        .await?;
        Ok(Box::new(transport))
    }
}
