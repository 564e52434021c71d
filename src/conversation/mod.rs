//! # Conversation State Controller
//!
//! Owns everything the UI renders: the message list, the topic log, the
//! loading flag, live mode with its status and the audio visualization level.
//! Every mutation publishes a fresh `ConversationSnapshot` on a watch channel.
//!
//! ## Key Operations:
//! - **send_user_message**: Append the user turn, stream the model turn into a placeholder
//! - **start_live_session / stop_live_session**: Drive the live audio pipeline
//! - **update_config**: Re-establish the chat session when settings change
//!
//! ## Concurrency:
//! State sits behind a short `parking_lot` lock that is never held across an
//! `.await`. The live pipeline slot is a `tokio` mutex so concurrent starts
//! serialize. Callbacks from a live session carry the epoch they were created
//! in and are ignored once that session has been stopped.

pub mod inactivity;
pub mod message;
pub mod topic;

use crate::audio::device::AudioHost;
use crate::audio::pipeline::{LiveObserver, LivePipeline};
use crate::config::{ChatConfig, ConversationConfig, LiveConfig};
use crate::error::{CoreError, CoreResult};
use crate::session::{SessionClient, SessionState};
use futures_util::StreamExt;
use inactivity::{ActivityInputs, InactivityTimer};
use message::ChatMessage;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use topic::Topic;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Status of the live voice overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum LiveStatus {
    Idle,
    Connecting,
    Connected,
    Closed,
    Error(String),
}

/// Everything the UI shell renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub messages: Vec<ChatMessage>,
    pub topics: Vec<Topic>,
    pub is_loading: bool,
    pub live_mode: bool,
    pub live_status: LiveStatus,
    pub audio_volume: f32,
}

impl Default for ConversationSnapshot {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            topics: Vec::new(),
            is_loading: false,
            live_mode: false,
            live_status: LiveStatus::Idle,
            audio_volume: 0.0,
        }
    }
}

struct ConversationState {
    messages: Vec<ChatMessage>,
    topics: Vec<Topic>,
    is_loading: bool,
    live_mode: bool,
    live_status: LiveStatus,
    audio_volume: f32,
    live_epoch: u64,
    inactivity: InactivityTimer,
}

impl ConversationState {
    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.messages.clone(),
            topics: self.topics.clone(),
            is_loading: self.is_loading,
            live_mode: self.live_mode,
            live_status: self.live_status.clone(),
            audio_volume: self.audio_volume,
        }
    }

    fn activity(&self) -> ActivityInputs {
        ActivityInputs {
            message_count: self.messages.len(),
            is_loading: self.is_loading,
            live_mode: self.live_mode,
        }
    }

    fn message_mut(&mut self, id: Uuid) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// The live pipeline slot. Never held across an `.await`.
enum LiveSlot {
    Idle,
    /// A start is acquiring devices or connecting
    Starting {
        attempt: Uuid,
        cancel: oneshot::Sender<()>,
        /// Resolves (with an error) once the start has returned
        finished: oneshot::Receiver<()>,
    },
    Running(LivePipeline),
}

impl LiveSlot {
    fn is_starting(&self, id: Uuid) -> bool {
        matches!(self, LiveSlot::Starting { attempt, .. } if *attempt == id)
    }
}

struct Inner {
    client: Arc<SessionClient>,
    audio_host: Arc<dyn AudioHost>,
    settings: ConversationConfig,
    live_settings: LiveConfig,
    chat_config: RwLock<ChatConfig>,
    state: Mutex<ConversationState>,
    updates: watch::Sender<ConversationSnapshot>,
    live: Mutex<LiveSlot>,
}

impl Inner {
    /// Run `f` on the state, re-evaluate the inactivity timer and publish.
    fn mutate<R>(self: &Arc<Self>, f: impl FnOnce(&mut ConversationState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.after_mutation(&mut state);
        result
    }

    fn after_mutation(self: &Arc<Self>, state: &mut ConversationState) {
        let weak = Arc::downgrade(self);
        let inputs = state.activity();
        state.inactivity.observe(inputs, move |generation| {
            if let Some(inner) = weak.upgrade() {
                inner.inactivity_expired(generation);
            }
        });
        self.updates.send_replace(state.snapshot());
    }

    fn inactivity_expired(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if !state.inactivity.is_current(generation) {
            return;
        }
        state.inactivity.expired(generation);
        info!(cleared = state.messages.len(), "Conversation idle, clearing messages");
        state.messages.clear();
        self.after_mutation(&mut state);
    }

    /// Body of `start_live_session`, run on its own task.
    async fn run_live_start(
        self: Arc<Self>,
        attempt: Uuid,
        epoch: u64,
        mut cancel: oneshot::Receiver<()>,
    ) -> CoreResult<()> {
        let observer = Arc::new(ControllerObserver {
            inner: Arc::downgrade(&self),
            epoch,
        });
        let chat_config = self.chat_config.read().clone();
        let started = LivePipeline::start(
            self.audio_host.as_ref(),
            Arc::clone(&self.client),
            &chat_config,
            &self.live_settings,
            observer,
            &mut cancel,
        )
        .await;

        match started {
            Ok(pipeline) => {
                let installed = {
                    let mut slot = self.live.lock();
                    if slot.is_starting(attempt) {
                        *slot = LiveSlot::Running(pipeline);
                        None
                    } else {
                        Some(pipeline)
                    }
                };
                match installed {
                    None => Ok(()),
                    // Stopped after the pipeline came up but before it was recorded
                    Some(pipeline) => {
                        pipeline.stop().await;
                        Err(CoreError::Cancelled)
                    }
                }
            }
            Err(CoreError::Cancelled) => {
                info!("Live session start cancelled");
                Err(CoreError::Cancelled)
            }
            Err(e) => {
                error!(error = %e, "Failed to start live session");
                {
                    let mut slot = self.live.lock();
                    if slot.is_starting(attempt) {
                        *slot = LiveSlot::Idle;
                    }
                }
                let message = e.to_string();
                self.live_update(epoch, |state| state.live_status = LiveStatus::Error(message));
                Err(e)
            }
        }
    }

    /// Apply a live callback if it still belongs to the running session.
    fn live_update(self: &Arc<Self>, epoch: u64, f: impl FnOnce(&mut ConversationState)) {
        let mut state = self.state.lock();
        if state.live_epoch != epoch || !state.live_mode {
            return;
        }
        f(&mut state);
        self.after_mutation(&mut state);
    }
}

/// Bridges pipeline events into conversation state.
struct ControllerObserver {
    inner: Weak<Inner>,
    epoch: u64,
}

impl ControllerObserver {
    fn update(&self, f: impl FnOnce(&mut ConversationState)) {
        if let Some(inner) = self.inner.upgrade() {
            inner.live_update(self.epoch, f);
        }
    }
}

impl LiveObserver for ControllerObserver {
    fn volume(&self, level: f32) {
        self.update(|state| state.audio_volume = level.clamp(0.0, 1.0));
    }

    fn opened(&self) {
        self.update(|state| state.live_status = LiveStatus::Connected);
    }

    fn error(&self, message: String) {
        self.update(|state| state.live_status = LiveStatus::Error(message));
    }

    fn closed(&self) {
        self.update(|state| {
            if !matches!(state.live_status, LiveStatus::Error(_)) {
                state.live_status = LiveStatus::Closed;
            }
            state.audio_volume = 0.0;
        });
    }
}

/// Cheap to clone; all clones share one conversation.
#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<Inner>,
}

impl ConversationController {
    /// Create the controller and start the chat session.
    pub fn new(
        client: Arc<SessionClient>,
        audio_host: Arc<dyn AudioHost>,
        chat_config: ChatConfig,
        live_settings: LiveConfig,
        settings: ConversationConfig,
    ) -> Self {
        client.start_chat(&chat_config);
        let (updates, _) = watch::channel(ConversationSnapshot::default());
        let inactivity = InactivityTimer::new(settings.inactivity_timeout());

        Self {
            inner: Arc::new(Inner {
                client,
                audio_host,
                settings,
                live_settings,
                chat_config: RwLock::new(chat_config),
                state: Mutex::new(ConversationState {
                    messages: Vec::new(),
                    topics: Vec::new(),
                    is_loading: false,
                    live_mode: false,
                    live_status: LiveStatus::Idle,
                    audio_volume: 0.0,
                    live_epoch: 0,
                    inactivity,
                }),
                updates,
                live: Mutex::new(LiveSlot::Idle),
            }),
        }
    }

    /// Send a user message and stream the reply into the conversation.
    ///
    /// Blank input is ignored, as is input while a reply is still streaming.
    /// Resolves when the model turn has ended; a failed turn shows the
    /// configured error text instead of propagating.
    pub async fn send_user_message(&self, text: &str) {
        match self.accept_user_message(text) {
            Ok(pending) => pending.stream().await,
            Err(rejection) => debug!(?rejection, "Message not accepted"),
        }
    }

    /// Append the user turn and reserve the reply slot in one step.
    ///
    /// On success the conversation is already loading, so a concurrent caller
    /// is rejected with `SendRejection::Busy`; the reply streams once the
    /// returned `PendingReply` is driven.
    pub fn accept_user_message(&self, text: &str) -> Result<PendingReply, SendRejection> {
        if text.trim().is_empty() {
            return Err(SendRejection::Blank);
        }

        let mut state = self.inner.state.lock();
        if state.is_loading {
            return Err(SendRejection::Busy);
        }

        state.messages.push(ChatMessage::user(text));
        state
            .topics
            .insert(0, Topic::from_input(text, self.inner.settings.summary_length));
        let placeholder = ChatMessage::model_placeholder();
        let reply_id = placeholder.id;
        state.messages.push(placeholder);
        state.is_loading = true;
        self.inner.after_mutation(&mut state);

        Ok(PendingReply {
            inner: Arc::clone(&self.inner),
            text: text.to_string(),
            reply_id,
        })
    }

    /// Enter live mode and start the voice pipeline.
    ///
    /// Fails with `CoreError::LiveSessionActive` while a session is starting
    /// or running, and with `CoreError::Cancelled` when `stop_live_session`
    /// interrupts the start. Other failures leave live mode on with an error
    /// status so the overlay can show it; starting again retries.
    pub async fn start_live_session(&self) -> CoreResult<()> {
        let attempt = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        let (previous, epoch) = {
            let mut slot = self.inner.live.lock();
            match &*slot {
                LiveSlot::Starting { .. } => return Err(CoreError::LiveSessionActive),
                LiveSlot::Running(pipeline) if !pipeline.session().is_closed() => {
                    return Err(CoreError::LiveSessionActive)
                }
                _ => {}
            }
            let previous = std::mem::replace(
                &mut *slot,
                LiveSlot::Starting {
                    attempt,
                    cancel: cancel_tx,
                    finished: finished_rx,
                },
            );
            // Under the slot lock so a concurrent stop always observes this epoch
            let epoch = self.inner.mutate(|state| {
                state.live_epoch += 1;
                state.live_mode = true;
                state.live_status = LiveStatus::Connecting;
                state.audio_volume = 0.0;
                state.live_epoch
            });
            (previous, epoch)
        };
        if let LiveSlot::Running(closed) = previous {
            closed.stop().await;
        }

        // Own task, so a caller that goes away cannot strand the slot in `Starting`
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _finished = finished_tx;
            inner.run_live_start(attempt, epoch, cancel_rx).await
        });
        task.await.unwrap_or_else(|e| {
            error!(error = %e, "Live start task failed");
            Err(CoreError::Cancelled)
        })
    }

    /// Leave live mode and release the pipeline.
    ///
    /// A start in progress is cancelled; this returns once it has released
    /// whatever it had acquired.
    pub async fn stop_live_session(&self) {
        let previous = std::mem::replace(&mut *self.inner.live.lock(), LiveSlot::Idle);
        self.inner.mutate(|state| {
            state.live_epoch += 1;
            state.live_mode = false;
            state.live_status = LiveStatus::Idle;
            state.audio_volume = 0.0;
        });
        match previous {
            LiveSlot::Idle => {}
            LiveSlot::Starting { cancel, finished, .. } => {
                info!("Cancelling live session start");
                let _ = cancel.send(());
                let _ = finished.await;
            }
            LiveSlot::Running(pipeline) => pipeline.stop().await,
        }
    }

    /// Replace the chat settings. Returns whether anything changed; the chat
    /// session is only re-established on a change.
    pub fn update_config(&self, config: ChatConfig) -> anyhow::Result<bool> {
        config.validate()?;
        {
            let mut current = self.inner.chat_config.write();
            if *current == config {
                return Ok(false);
            }
            *current = config.clone();
        }
        self.inner.client.start_chat(&config);
        Ok(true)
    }

    pub fn chat_config(&self) -> ChatConfig {
        self.inner.chat_config.read().clone()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.inner.state.lock().snapshot()
    }

    /// Receive a snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.inner.updates.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.client.state()
    }

    /// Release the live pipeline, if any, before the process exits.
    pub async fn shutdown(&self) {
        let active = !matches!(*self.inner.live.lock(), LiveSlot::Idle);
        if active {
            info!("Stopping live session for shutdown");
            self.stop_live_session().await;
        }
    }
}

/// Why `accept_user_message` turned a message away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejection {
    /// Empty or whitespace-only text
    Blank,
    /// A reply is still streaming
    Busy,
}

/// An accepted user turn whose reply has not been streamed yet.
#[must_use = "the conversation stays loading until `stream` runs"]
pub struct PendingReply {
    inner: Arc<Inner>,
    text: String,
    reply_id: Uuid,
}

impl PendingReply {
    /// Stream the model reply into the placeholder message.
    pub async fn stream(self) {
        let reply_id = self.reply_id;
        let failure = match self.inner.client.send_message_stream(&self.text).await {
            Ok(mut turn) => {
                let mut failure = None;
                while let Some(fragment) = turn.next().await {
                    match fragment {
                        Ok(delta) => self.inner.mutate(|state| {
                            if let Some(reply) = state.message_mut(reply_id) {
                                reply.content.push_str(&delta);
                            }
                        }),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                failure
            }
            Err(e) => Some(e),
        };

        let error_text = self.inner.settings.error_text.clone();
        self.inner.mutate(|state| {
            if let Some(reply) = state.message_mut(reply_id) {
                if let Some(e) = &failure {
                    warn!(error = %e, "Chat turn failed");
                    reply.content = error_text;
                    reply.is_error = true;
                }
                reply.is_streaming = false;
            }
            state.is_loading = false;
        });
    }
}
