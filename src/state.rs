//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Ownership:
//! - **config**: `Arc<RwLock<AppConfig>>` so the settings surface can update the
//!   chat section at runtime while handlers read it concurrently
//! - **controller**: The single conversation; cloning it only clones an `Arc`
//! - **push_connections**: Number of open `/ws/conversation` sockets
//! - **start_time**: Never changes, so no lock is needed

use crate::config::{AppConfig, ChatConfig};
use crate::conversation::ConversationController;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Effective configuration; the `chat` section follows runtime updates
    pub config: Arc<RwLock<AppConfig>>,

    pub controller: ConversationController,

    push_connections: Arc<AtomicUsize>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, controller: ConversationController) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            controller,
            push_connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Apply new chat settings to the controller and record them.
    ///
    /// Returns whether the chat session was re-established.
    pub fn update_chat_config(&self, chat: ChatConfig) -> Result<bool, String> {
        let changed = self
            .controller
            .update_config(chat.clone())
            .map_err(|e| e.to_string())?;
        self.config.write().chat = chat;
        Ok(changed)
    }

    pub fn connection_opened(&self) {
        self.push_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a close without a matching open must not wrap around
        let _ = self
            .push_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn push_connections(&self) -> usize {
        self.push_connections.load(Ordering::Relaxed)
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
