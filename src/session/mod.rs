//! # Session Client
//!
//! Owns the connection to the generative backend: one text-chat session and at
//! most one live audio session. The two are independent sub-machines.
//!
//! ## Chat:
//! `start_chat` replaces the active chat session. Every session gets a
//! generation number; a `ChatTurn` belonging to a superseded generation stops
//! yielding fragments and ends, so a stale reply never lands in the new chat.
//!
//! ## Live:
//! `connect_live` refuses to open a second session while one is not closed.
//! Frames are sent fire-and-forget through the returned handle.

pub mod backend;
pub mod gemini;
pub mod live;

use crate::config::ChatConfig;
use crate::error::{CoreError, CoreResult};
use backend::{ChatTransport, GenerativeBackend};
use futures_util::Stream;
use live::{LiveCallbacks, LiveSessionHandle, LiveState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Chat sub-machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Uninitialized,
    Ready,
}

/// Combined view used by health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub chat: ChatState,
    pub live: LiveState,
}

struct ChatSlot {
    generation: u64,
    transport: Arc<dyn ChatTransport>,
}

pub struct SessionClient {
    backend: Arc<dyn GenerativeBackend>,
    chat: RwLock<Option<ChatSlot>>,
    generation: Arc<AtomicU64>,
    live: Mutex<Option<Arc<LiveSessionHandle>>>,
    /// Serializes `connect_live` calls
    connect_gate: tokio::sync::Mutex<()>,
    connecting: Arc<AtomicBool>,
}

/// Clears the connecting flag when a connect ends, including when its future is dropped.
struct ConnectingGuard(Arc<AtomicBool>);

impl ConnectingGuard {
    fn set(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SessionClient {
    pub fn new(backend: Arc<dyn GenerativeBackend>) -> Self {
        Self {
            backend,
            chat: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            live: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
            connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create (or replace) the chat session.
    pub fn start_chat(&self, config: &ChatConfig) {
        let transport = self.backend.create_streaming_chat(config);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.chat.write() = Some(ChatSlot { generation, transport });
        info!(generation, model = %config.model, "Chat session started");
    }

    /// Send a user message on the current chat session.
    ///
    /// Fails with `CoreError::NotInitialized` before `start_chat`. The returned
    /// stream yields non-empty text fragments until the model turn ends.
    pub async fn send_message_stream(&self, text: &str) -> CoreResult<ChatTurn> {
        let (generation, transport) = {
            let guard = self.chat.read();
            let slot = guard.as_ref().ok_or(CoreError::NotInitialized)?;
            (slot.generation, Arc::clone(&slot.transport))
        };

        debug!(generation, chars = text.chars().count(), "Sending chat message");
        let receiver = transport.send_message_stream(text).await?;

        Ok(ChatTurn {
            receiver,
            generation,
            current: Arc::clone(&self.generation),
            finished: false,
        })
    }

    /// Open the live audio session.
    ///
    /// Rejected with `CoreError::LiveSessionActive` while a previous session
    /// is not closed or another connect is in flight; the existing session is
    /// left untouched. Dropping the returned future abandons the connect and
    /// leaves the client idle.
    pub async fn connect_live(
        &self,
        config: &ChatConfig,
        callbacks: Arc<dyn LiveCallbacks>,
    ) -> CoreResult<Arc<LiveSessionHandle>> {
        let _gate = self
            .connect_gate
            .try_lock()
            .map_err(|_| CoreError::LiveSessionActive)?;
        if self.live.lock().as_ref().is_some_and(|existing| !existing.is_closed()) {
            return Err(CoreError::LiveSessionActive);
        }

        let _connecting = ConnectingGuard::set(&self.connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.backend.open_live_session(config, events_tx).await?;
        let handle = LiveSessionHandle::spawn(transport, events_rx, callbacks);
        info!(session_id = %handle.id(), "Live session connecting");

        *self.live.lock() = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Close the active live session, if any.
    pub async fn disconnect_live(&self) {
        let handle = self.live.lock().take();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    pub fn chat_state(&self) -> ChatState {
        if self.chat.read().is_some() {
            ChatState::Ready
        } else {
            ChatState::Uninitialized
        }
    }

    /// A connect that has not produced a handle yet reads as `Connecting`.
    pub fn live_state(&self) -> LiveState {
        if self.connecting.load(Ordering::SeqCst) {
            return LiveState::Connecting;
        }
        self.live
            .lock()
            .as_ref()
            .map(|handle| handle.state())
            .unwrap_or(LiveState::Idle)
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            chat: self.chat_state(),
            live: self.live_state(),
        }
    }
}

/// Fragments of one model turn.
///
/// Ends at end-of-turn, after a transport error, or as soon as the chat
/// session it belongs to has been replaced.
pub struct ChatTurn {
    receiver: mpsc::Receiver<CoreResult<String>>,
    generation: u64,
    current: Arc<AtomicU64>,
    finished: bool,
}

impl ChatTurn {
    fn is_orphaned(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.generation
    }
}

impl Stream for ChatTurn {
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }
            if self.is_orphaned() {
                debug!(generation = self.generation, "Discarding fragments of superseded chat");
                self.finished = true;
                self.receiver.close();
                return Poll::Ready(None);
            }

            match self.receiver.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(fragment))) => {
                    if fragment.is_empty() || self.is_orphaned() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(fragment)));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory backend shared by the session, pipeline and controller tests.

    use super::backend::{ChatTransport, GenerativeBackend, LiveEvent, LiveTransport};
    use crate::audio::codec::WireFrame;
    use crate::config::ChatConfig;
    use crate::error::{CoreError, CoreResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// What the fake chat does with the next message.
    #[derive(Debug, Clone)]
    pub enum ScriptedTurn {
        /// Yield these fragments, then end the turn
        Reply(Vec<String>),
        /// Yield these fragments, then fail
        FailAfter(Vec<String>),
        /// Reject the request outright
        Reject,
        /// Hand the sender to the test for manual driving
        Manual,
    }

    #[derive(Default)]
    pub struct FakeBackend {
        pub chats_created: Mutex<Vec<ChatConfig>>,
        pub script: Mutex<VecDeque<ScriptedTurn>>,
        pub sent_messages: Mutex<Vec<String>>,
        pub manual_turns: Mutex<Vec<mpsc::Sender<CoreResult<String>>>>,
        pub live_events: Mutex<Option<mpsc::UnboundedSender<LiveEvent>>>,
        pub live_frames: Arc<Mutex<Vec<WireFrame>>>,
        pub live_closes: Arc<Mutex<u32>>,
        pub fail_live_connect: Mutex<bool>,
        /// Live connects never resolve while set
        pub hang_live_connect: Mutex<bool>,
    }

    impl FakeBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push_turn(&self, turn: ScriptedTurn) {
            self.script.lock().push_back(turn);
        }

        pub fn reply(&self, fragments: &[&str]) {
            self.push_turn(ScriptedTurn::Reply(fragments.iter().map(|s| s.to_string()).collect()));
        }

        /// Emit a live event as the server would.
        pub fn emit(&self, event: LiveEvent) {
            if let Some(tx) = self.live_events.lock().as_ref() {
                let _ = tx.send(event);
            }
        }

        pub fn take_manual_turn(&self) -> mpsc::Sender<CoreResult<String>> {
            self.manual_turns.lock().remove(0)
        }
    }

    struct FakeChat {
        backend: Arc<FakeBackend>,
    }

    #[async_trait]
    impl ChatTransport for FakeChat {
        async fn send_message_stream(&self, text: &str) -> CoreResult<mpsc::Receiver<CoreResult<String>>> {
            self.backend.sent_messages.lock().push(text.to_string());
            let turn = self
                .backend
                .script
                .lock()
                .pop_front()
                .unwrap_or(ScriptedTurn::Reply(vec!["ok".to_string()]));

            let (tx, rx) = mpsc::channel(32);
            match turn {
                ScriptedTurn::Reply(fragments) => {
                    for fragment in fragments {
                        let _ = tx.try_send(Ok(fragment));
                    }
                }
                ScriptedTurn::FailAfter(fragments) => {
                    for fragment in fragments {
                        let _ = tx.try_send(Ok(fragment));
                    }
                    let _ = tx.try_send(Err(CoreError::Transport("connection reset".to_string())));
                }
                ScriptedTurn::Reject => {
                    return Err(CoreError::Transport("request rejected".to_string()));
                }
                ScriptedTurn::Manual => {
                    self.backend.manual_turns.lock().push(tx);
                }
            }
            Ok(rx)
        }
    }

    struct FakeLive {
        frames: Arc<Mutex<Vec<WireFrame>>>,
        closes: Arc<Mutex<u32>>,
    }

    impl LiveTransport for FakeLive {
        fn send_audio(&self, frame: WireFrame) -> CoreResult<()> {
            self.frames.lock().push(frame);
            Ok(())
        }

        fn close(&self) {
            *self.closes.lock() += 1;
        }
    }

    /// `GenerativeBackend` needs `Arc<FakeBackend>` inside the chat, so the
    /// trait is implemented on the Arc.
    #[async_trait]
    impl GenerativeBackend for Arc<FakeBackend> {
        fn create_streaming_chat(&self, config: &ChatConfig) -> Arc<dyn ChatTransport> {
            self.chats_created.lock().push(config.clone());
            Arc::new(FakeChat {
                backend: Arc::clone(self),
            })
        }

        async fn open_live_session(
            &self,
            _config: &ChatConfig,
            events: mpsc::UnboundedSender<LiveEvent>,
        ) -> CoreResult<Box<dyn LiveTransport>> {
            if *self.fail_live_connect.lock() {
                return Err(CoreError::Transport("live endpoint unreachable".to_string()));
            }
            let hang = *self.hang_live_connect.lock();
            if hang {
                std::future::pending::<()>().await;
            }
            *self.live_events.lock() = Some(events);
            Ok(Box::new(FakeLive {
                frames: Arc::clone(&self.live_frames),
                closes: Arc::clone(&self.live_closes),
            }))
        }
    }
}
