//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code, including the persona chat settings)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (`GEMINI_API_KEY`/`API_KEY`, `HOST`, `PORT`)
//! 2. Environment variables (APP_SERVER__PORT, APP_CHAT__TEMPERATURE, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! ## ChatConfig:
//! The chat settings double as the "settings surface" of the UI shell. They can
//! be edited at runtime through `ChatConfig::apply_json`, and every effective
//! change re-establishes the chat session.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Persona instruction used when no other system instruction is configured.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are the AI portfolio assistant of a senior frontend and full stack engineer.

IDENTITY:
You speak on the engineer's behalf to visitors of their portfolio site. You are professional, enthusiastic and persuasive.

CORE SKILLS:
- Frontend: Angular, React, TypeScript, Tailwind CSS, Framer Motion.
- AI integration: Gemini API, OpenAI API, RAG architectures.
- Architecture: component-based design, micro-frontends, state management.

PROJECTS TO HIGHLIGHT:
1. Nebula Chat: a real-time streaming AI chat interface.
2. Portfolio V2: a personal showcase built on modern web standards.
3. E-commerce analytics dashboard: real-time sales tracking.

GOAL:
Answer questions about background, stack and projects. When asked about hiring, emphasise attention to detail and code quality.

TONE:
Sophisticated, helpful and confident. Keep answers concise but informative.

LANGUAGE:
Answer in the language the visitor uses (English or Spanish).";

/// Models offered by the settings surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeminiModel {
    Flash,
    Pro,
    ThinkingFlash,
    Live,
}

impl GeminiModel {
    pub const ALL: [GeminiModel; 4] = [
        GeminiModel::Flash,
        GeminiModel::Pro,
        GeminiModel::ThinkingFlash,
        GeminiModel::Live,
    ];

    /// Identifier the Gemini API expects.
    pub fn id(&self) -> &'static str {
        match self {
            GeminiModel::Flash => "gemini-2.5-flash",
            GeminiModel::Pro => "gemini-3-pro-preview",
            GeminiModel::ThinkingFlash => "gemini-2.5-flash-thinking",
            GeminiModel::Live => "gemini-2.5-flash-native-audio-preview-09-2025",
        }
    }

    /// Whether the model is used for text chat (the live model is audio only).
    pub fn supports_text_chat(&self) -> bool {
        !matches!(self, GeminiModel::Live)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub chat: ChatConfig,
    pub live: LiveConfig,
    pub conversation: ConversationConfig,
}

/// Where the UI shell reaches this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection settings for the Gemini API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// API key; normally injected through `GEMINI_API_KEY` or `API_KEY`
    pub api_key: String,
    /// REST base for text chat streaming
    pub api_base_url: String,
    /// WebSocket endpoint of the Live API
    pub live_url: String,
    /// Model used for live voice sessions
    pub live_model: String,
    /// Prebuilt voice of the live session
    pub voice_name: String,
    /// Timeout for establishing a chat stream (seconds)
    pub request_timeout_secs: u64,
}

/// Generation settings of the text chat session.
///
/// Immutable value object: the controller compares old and new values and only
/// re-establishes the chat session when they differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub model: String,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub system_instruction: String,
}

/// Which audio backend the live pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioHostKind {
    /// Headless: silent capture, clock-only output
    Null,
    /// Real devices through cpal (requires the `cpal-host` feature)
    Cpal,
}

/// Live voice session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub audio_host: AudioHostKind,
    /// Samples per capture block (at 16 kHz, 4096 samples is 256 ms)
    pub capture_block_size: usize,
    /// Multiplier applied to block RMS before clamping to 1
    pub volume_gain: f32,
    /// Playback rate used when a server chunk does not declare one
    pub output_sample_rate: u32,
    /// Fixed visualization level while model audio is playing
    pub output_pulse_level: f32,
}

/// Conversation controller behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Idle time before the message list is cleared (seconds)
    pub inactivity_timeout_secs: u64,
    /// Characters of user input kept in a topic summary
    pub summary_length: usize,
    /// Text shown on a model turn whose stream failed
    pub error_text: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            backend: BackendConfig::default(),
            chat: ChatConfig::default(),
            live: LiveConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            live_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            live_model: GeminiModel::Live.id().to_string(),
            voice_name: "Kore".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: GeminiModel::Flash.id().to_string(),
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            audio_host: AudioHostKind::Null,
            capture_block_size: 4096,
            volume_gain: 5.0,
            output_sample_rate: 24_000,
            output_pulse_level: 0.6,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 15,
            summary_length: 40,
            error_text: "Connection error.".to_string(),
        }
    }
}

impl ConversationConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

impl ChatConfig {
    /// Check the generation parameters are in the ranges the API accepts.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Model must not be empty"));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0 and 2"));
        }

        if self.top_k == 0 {
            return Err(anyhow::anyhow!("Top-K must be at least 1"));
        }

        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(anyhow::anyhow!("Top-P must be in (0, 1]"));
        }

        Ok(())
    }

    /// Apply a partial update coming from the settings surface.
    ///
    /// Only the fields present in the JSON object are changed, e.g.
    /// `{"temperature": 0.2}` keeps model, top-K, top-P and the instruction.
    /// Field names are accepted in snake_case and camelCase.
    pub fn apply_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let field = |snake: &str, camel: &str| partial.get(snake).or_else(|| partial.get(camel)).cloned();

        let mut updated = self.clone();

        if let Some(model) = field("model", "model").as_ref().and_then(|v| v.as_str()) {
            updated.model = model.to_string();
        }
        if let Some(temperature) = field("temperature", "temperature").as_ref().and_then(|v| v.as_f64()) {
            updated.temperature = temperature as f32;
        }
        if let Some(top_k) = field("top_k", "topK").as_ref().and_then(|v| v.as_u64()) {
            updated.top_k = u32::try_from(top_k).map_err(|_| anyhow::anyhow!("Top-K is out of range"))?;
        }
        if let Some(top_p) = field("top_p", "topP").as_ref().and_then(|v| v.as_f64()) {
            updated.top_p = top_p as f32;
        }
        if let Some(instruction) = field("system_instruction", "systemInstruction")
            .as_ref()
            .and_then(|v| v.as_str())
        {
            updated.system_instruction = instruction.to_string();
        }

        // Validate before committing so a bad edit leaves the current config intact
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_CHAT__TEMPERATURE=0.2`: Override chat temperature
    /// - `APP_LIVE__AUDIO_HOST=cpal`: Use real audio devices
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: API key
    /// - `HOST` / `PORT`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(api_key) = env::var("GEMINI_API_KEY").or_else(|_| env::var("API_KEY")) {
            settings = settings.set_override("backend.api_key", api_key)?;
        }

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        self.chat.validate()?;

        if self.live.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.live.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Output sample rate must be greater than 0"));
        }

        if self.live.volume_gain <= 0.0 {
            return Err(anyhow::anyhow!("Volume gain must be positive"));
        }

        if self.conversation.inactivity_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Inactivity timeout must be greater than 0"));
        }

        if self.conversation.summary_length == 0 {
            return Err(anyhow::anyhow!("Topic summary length must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.chat.model, "gemini-2.5-flash");
        assert_eq!(config.chat.top_k, 40);
        assert_eq!(config.conversation.inactivity_timeout(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.chat.top_p = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.capture_block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chat_config_partial_update() {
        let mut chat = ChatConfig::default();
        let json = r#"{"temperature": 0.2, "topK": 12}"#;
        assert!(chat.apply_json(json).is_ok());
        assert!((chat.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(chat.top_k, 12);
        // Untouched fields keep their values
        assert_eq!(chat.model, "gemini-2.5-flash");
        assert_eq!(chat.system_instruction, DEFAULT_SYSTEM_INSTRUCTION);
    }

    #[test]
    fn test_chat_config_rejected_update_keeps_previous_values() {
        let mut chat = ChatConfig::default();
        let json = r#"{"temperature": 0.3, "top_p": 1.5}"#;
        assert!(chat.apply_json(json).is_err());
        assert!((chat.temperature - 0.7).abs() < f32::EPSILON);
        assert!((chat.top_p - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn test_model_catalog() {
        assert_eq!(GeminiModel::Live.id(), BackendConfig::default().live_model);
        let chat_models: Vec<_> = GeminiModel::ALL
            .iter()
            .filter(|m| m.supports_text_chat())
            .collect();
        assert_eq!(chat_models.len(), 3);
    }
}
