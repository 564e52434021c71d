//! Live API transport over WebSocket.
//!
//! ## Protocol:
//! 1. Connect to `{live_url}?key=...` and send a `setup` message
//! 2. Server answers `setupComplete` → `LiveEvent::Open`
//! 3. Client streams `realtimeInput.mediaChunks` (16kHz PCM)
//! 4. Server streams `serverContent.modelTurn.parts[].inlineData` (24kHz PCM)
//!
//! The socket is split: a writer task drains a bounded queue of outbound
//! messages, a reader task turns server messages into `LiveEvent`s.

use super::protocol::{RealtimeInputMessage, ServerMessage, SetupMessage};
use crate::audio::codec::WireFrame;
use crate::error::{CoreError, CoreResult};
use crate::session::backend::{InboundAudio, LiveEvent, LiveTransport};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Outbound messages queued ahead of the socket. At 256 ms per frame this is
/// several seconds of audio; beyond that frames are dropped.
const OUTBOUND_QUEUE_CAPACITY: usize = 32;

pub struct GeminiLive {
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Connect, send the setup message and start the reader/writer tasks.
///
/// The handshake and the setup send share one `connect_timeout` budget.
pub async fn connect(
    live_url: &str,
    api_key: &str,
    setup: SetupMessage,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<LiveEvent>,
) -> CoreResult<GeminiLive> {
    let url = format!("{}?key={}", live_url, api_key);
    let setup_text = serde_json::to_string(&setup)?;

    let handshake = async {
        let (socket, _) = connect_async(url.as_str()).await?;
        info!(model = %setup.setup.model, "Live socket connected");
        let (mut sink, stream) = socket.split();
        sink.send(Message::Text(setup_text.into())).await?;
        Ok::<_, CoreError>((sink, stream))
    };
    let (mut sink, mut stream) = tokio::time::timeout(connect_timeout, handshake)
        .await
        .map_err(|_| {
            CoreError::Transport(format!(
                "live connect timed out after {}s",
                connect_timeout.as_secs_f32()
            ))
        })??;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "Live writer stopped");
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => forward_server_message(&text, &events),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => forward_server_message(text, &events),
                    Err(_) => warn!(len = bytes.len(), "Ignoring non-UTF-8 binary message"),
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Live socket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = events.send(LiveEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        let _ = events.send(LiveEvent::Closed);
    });

    Ok(GeminiLive {
        outbound: outbound_tx,
        closed: AtomicBool::new(false),
        reader: Mutex::new(Some(reader)),
    })
}

/// Translate one server JSON message into events.
fn forward_server_message(text: &str, events: &mpsc::UnboundedSender<LiveEvent>) {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable live message");
            return;
        }
    };

    if message.setup_complete.is_some() {
        let _ = events.send(LiveEvent::Open);
    }
    for blob in message.audio_parts() {
        let _ = events.send(LiveEvent::Audio(InboundAudio {
            data: blob.data.clone(),
            mime_type: Some(blob.mime_type.clone()),
        }));
    }
    if message.go_away.is_some() {
        let _ = events.send(LiveEvent::Error("server is ending the session".to_string()));
    }
}

impl LiveTransport for GeminiLive {
    fn send_audio(&self, frame: WireFrame) -> CoreResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CoreError::Transport("live socket is closed".to_string()));
        }
        let payload = serde_json::to_string(&RealtimeInputMessage::audio(frame.data, frame.mime_type))?;
        self.outbound
            .try_send(Message::Text(payload.into()))
            .map_err(|e| CoreError::Transport(format!("live outbound queue: {}", e)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        // A full queue means the writer is stuck; Drop aborts the reader
        let _ = self.outbound.try_send(Message::Close(None));
    }
}

impl Drop for GeminiLive {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_messages_become_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        forward_server_message(r#"{"setupComplete":{}}"#, &tx);
        forward_server_message(
            r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}}]}}}"#,
            &tx,
        );
        forward_server_message("not json", &tx);
        forward_server_message(r#"{"serverContent":{"turnComplete":true}}"#, &tx);
        forward_server_message(r#"{"goAway":{"timeLeft":"5s"}}"#, &tx);

        assert_eq!(rx.try_recv().unwrap(), LiveEvent::Open);
        assert_eq!(
            rx.try_recv().unwrap(),
            LiveEvent::Audio(InboundAudio {
                data: "AAAA".to_string(),
                mime_type: Some("audio/pcm;rate=24000".to_string()),
            })
        );
        assert!(matches!(rx.try_recv().unwrap(), LiveEvent::Error(_)));
        assert!(rx.try_recv().is_err());
    }

    use super::super::protocol::SetupMessage;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    async fn next_json<S>(socket: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended early: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_loopback_session_sends_setup_then_audio() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requested = Arc::new(Mutex::new(String::new()));

        let server = {
            let requested = Arc::clone(&requested);
            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut socket = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| {
                    *requested.lock() = req.uri().to_string();
                    Ok(resp)
                })
                .await
                .unwrap();

                let setup = next_json(&mut socket).await;
                socket
                    .send(Message::Text(r#"{"setupComplete":{}}"#.to_string().into()))
                    .await
                    .unwrap();
                let audio = next_json(&mut socket).await;
                (setup, audio)
            })
        };

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let live = connect(
            &format!("ws://{}/live", addr),
            "test-key",
            SetupMessage::audio("gemini-live-test", "Puck", "Be brief."),
            Duration::from_secs(5),
            events_tx,
        )
        .await
        .unwrap();

        assert_eq!(events.recv().await, Some(LiveEvent::Open));
        live.send_audio(WireFrame {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        })
        .unwrap();

        let (setup, audio) = server.await.unwrap();
        assert_eq!(*requested.lock(), "/live?key=test-key");
        assert_eq!(setup["setup"]["model"], "models/gemini-live-test");
        assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        let chunk = &audio["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAAA");

        live.close();
        assert!(live.send_audio(WireFrame {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts TCP but never completes the WebSocket handshake
        let _server = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let (events_tx, _events) = mpsc::unbounded_channel();
        let result = connect(
            &format!("ws://{}/live", addr),
            "test-key",
            SetupMessage::audio("gemini-live-test", "Puck", ""),
            Duration::from_millis(200),
            events_tx,
        )
        .await;

        match result {
            Err(CoreError::Transport(message)) => assert!(message.contains("timed out")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connect should time out"),
        }
    }
}
