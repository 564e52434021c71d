//! # Live Session Handle
//!
//! Wraps a `LiveTransport` and dispatches its events to a `LiveCallbacks`
//! implementation from a single task.
//!
//! ## Callback Contract:
//! - `on_open` fires at most once, before any audio
//! - `on_server_audio` fires once per inbound chunk, in arrival order
//! - `on_error` may fire zero or more times
//! - `on_close` fires exactly once, and nothing fires after it

use crate::audio::codec::WireFrame;
use crate::session::backend::{InboundAudio, LiveEvent, LiveTransport};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of the live sub-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Receiver of live session events.
pub trait LiveCallbacks: Send + Sync {
    fn on_open(&self);
    fn on_server_audio(&self, audio: InboundAudio);
    fn on_error(&self, message: String);
    fn on_close(&self);
}

/// One open audio session.
pub struct LiveSessionHandle {
    id: Uuid,
    state: Arc<watch::Sender<LiveState>>,
    transport: Box<dyn LiveTransport>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LiveSessionHandle {
    /// Start dispatching `events` to `callbacks`. The handle starts in `Connecting`.
    pub(crate) fn spawn(
        transport: Box<dyn LiveTransport>,
        events: mpsc::UnboundedReceiver<LiveEvent>,
        callbacks: Arc<dyn LiveCallbacks>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let (state_tx, _) = watch::channel(LiveState::Connecting);
        let state = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let dispatcher = tokio::spawn(dispatch(id, Arc::clone(&state), events, shutdown_rx, callbacks));

        Arc::new(Self {
            id,
            state,
            transport,
            shutdown: Mutex::new(Some(shutdown_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> LiveState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LiveState::Closed
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LiveState> {
        self.state.subscribe()
    }

    /// Send one captured frame. Dropped silently unless the session is open.
    pub fn send_audio_frame(&self, frame: WireFrame) {
        if self.state() != LiveState::Open {
            debug!(session_id = %self.id, "Dropping audio frame, session not open");
            return;
        }
        if let Err(e) = self.transport.send_audio(frame) {
            warn!(session_id = %self.id, error = %e, "Failed to queue audio frame");
        }
    }

    /// Close the session. `on_close` still fires once from the dispatcher.
    pub fn close(&self) {
        let previous = self.state.send_replace(LiveState::Closed);
        if previous != LiveState::Closed {
            info!(session_id = %self.id, "Closing live session");
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.transport.close();
    }

    /// Wait until every callback of this session has been delivered.
    pub async fn closed(&self) {
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }
}

async fn dispatch(
    id: Uuid,
    state: Arc<watch::Sender<LiveState>>,
    mut events: mpsc::UnboundedReceiver<LiveEvent>,
    mut shutdown: oneshot::Receiver<()>,
    callbacks: Arc<dyn LiveCallbacks>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            event = events.recv() => event,
        };

        // Anything after an explicit close is discarded
        if *state.borrow() == LiveState::Closed {
            break;
        }

        match event {
            Some(LiveEvent::Open) => {
                let opened = state.send_if_modified(|current| {
                    if *current == LiveState::Connecting {
                        *current = LiveState::Open;
                        true
                    } else {
                        false
                    }
                });
                if opened {
                    info!(session_id = %id, "Live session open");
                    callbacks.on_open();
                }
            }
            Some(LiveEvent::Audio(audio)) => callbacks.on_server_audio(audio),
            Some(LiveEvent::Error(message)) => {
                warn!(session_id = %id, error = %message, "Live session error");
                callbacks.on_error(message);
            }
            Some(LiveEvent::Closed) | None => break,
        }
    }

    state.send_replace(LiveState::Closed);
    debug!(session_id = %id, "Live session dispatcher finished");
    callbacks.on_close();
}
