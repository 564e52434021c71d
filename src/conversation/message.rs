//! Chat message model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One entry of the conversation.
///
/// A model message is created empty with `is_streaming` set, grows one delta
/// at a time and is frozen when its turn ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
    pub is_error: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            is_error: false,
        }
    }

    /// Empty placeholder for a model reply that is about to stream in.
    pub fn model_placeholder() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Model,
            content: String::new(),
            timestamp: Utc::now(),
            is_streaming: true,
            is_error: false,
        }
    }
}
