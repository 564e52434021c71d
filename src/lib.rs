//! # Persona Live Chat
//!
//! Streaming and session orchestration core of an AI-persona chat client.
//! One text-chat session and one live voice session run against Gemini; their
//! state is multiplexed into a single snapshot a UI shell can render.
//!
//! ## Layout:
//! - **audio**: PCM wire codec, playback scheduling, device seam, live pipeline
//! - **session**: Session client over a pluggable generative backend
//! - **conversation**: Message list, topic log, inactivity policy, live mode
//! - **config / error / state**: Ambient application plumbing
//! - **handlers / health / websocket**: HTTP and push surface for the UI shell

pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod handlers;
pub mod health;
pub mod session;
pub mod state;
pub mod websocket;
