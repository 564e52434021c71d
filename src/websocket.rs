//! # Conversation Push Socket
//!
//! `GET /ws/conversation` upgrades to a WebSocket that mirrors the conversation
//! to the UI shell. Every state change of the controller is pushed as a
//! `snapshot` message; the current state is sent right after the upgrade.
//!
//! ## Message Protocol:
//! - **Server → client**: `snapshot`, `ping`, `error` (JSON text frames)
//! - **Client → server**: `send_message`, `start_live`, `stop_live`, `pong`
//!
//! ## Connection Management:
//! - Heartbeat every 30 seconds, connection dropped after 60 seconds of silence
//! - The open connection count in `AppState` follows actor start/stop

use crate::conversation::{ConversationController, ConversationSnapshot, SendRejection};
use crate::state::AppState;
use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler, WrapFuture};
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages from the server.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Snapshot { conversation: &'a ConversationSnapshot },
    Ping { timestamp: i64 },
    Error { code: String, message: String },
}

/// Commands the UI shell may send instead of using the HTTP routes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SendMessage { text: String },
    StartLive,
    StopLive,
    Pong { timestamp: Option<i64> },
}

pub struct ConversationSocket {
    state: AppState,
    controller: ConversationController,
    last_heartbeat: Instant,
}

impl ConversationSocket {
    pub fn new(state: AppState) -> Self {
        let controller = state.controller.clone();
        Self {
            state,
            controller,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage<'_>) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize push message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_command(&mut self, command: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match command {
            ClientMessage::SendMessage { text } => match self.controller.accept_user_message(&text) {
                Ok(pending) => {
                    actix_web::rt::spawn(pending.stream());
                }
                Err(SendRejection::Blank) => {
                    self.send_error(ctx, "empty_message", "Message text must not be empty")
                }
                Err(SendRejection::Busy) => self.send_error(ctx, "busy", "A reply is still streaming"),
            },
            ClientMessage::StartLive => {
                let controller = self.controller.clone();
                ctx.spawn(
                    async move { controller.start_live_session().await }
                        .into_actor(self)
                        .map(|result, act, ctx| {
                            if let Err(e) = result {
                                act.send_error(ctx, "live_error", &e.to_string());
                            }
                        }),
                );
            }
            ClientMessage::StopLive => {
                let controller = self.controller.clone();
                actix_web::rt::spawn(async move {
                    controller.stop_live_session().await;
                });
            }
            ClientMessage::Pong { .. } => {
                self.last_heartbeat = Instant::now();
            }
        }
    }
}

impl Actor for ConversationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.connection_opened();
        info!(connections = self.state.push_connections(), "Push socket opened");

        // Yields the current snapshot first, then one per change
        ctx.add_stream(WatchStream::new(self.controller.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Push socket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            act.send(
                ctx,
                &ServerMessage::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
            );
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.connection_closed();
        info!(connections = self.state.push_connections(), "Push socket closed");
    }
}

impl StreamHandler<ConversationSnapshot> for ConversationSocket {
    fn handle(&mut self, snapshot: ConversationSnapshot, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::Snapshot { conversation: &snapshot });
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Conversation updates ended");
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(command) => self.handle_command(command, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary frames are not accepted");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "Push socket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New push socket request");
    ws::start(ConversationSocket::new(state.get_ref().clone()), &req, stream)
}
