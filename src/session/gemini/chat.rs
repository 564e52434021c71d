//! Streaming text chat over `models/{model}:streamGenerateContent?alt=sse`.
//!
//! The chat keeps the conversation history client-side and resends it with
//! every turn. A turn is appended to the history only when it completes.

use super::protocol::{Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig};
use super::sse::SseDecoder;
use crate::config::ChatConfig;
use crate::error::{CoreError, CoreResult};
use crate::session::backend::ChatTransport;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Deltas buffered between the HTTP reader and the consumer.
const DELTA_CHANNEL_CAPACITY: usize = 64;

pub struct GeminiChat {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    request_timeout: Duration,
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
    history: Arc<Mutex<Vec<Content>>>,
}

impl GeminiChat {
    pub fn new(http: reqwest::Client, api_base_url: &str, api_key: &str, request_timeout: Duration, config: &ChatConfig) -> Self {
        let endpoint = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            api_base_url.trim_end_matches('/'),
            config.model
        );
        let system_instruction = if config.system_instruction.trim().is_empty() {
            None
        } else {
            Some(Content::text(None, config.system_instruction.clone()))
        };

        Self {
            http,
            endpoint,
            api_key: api_key.to_string(),
            request_timeout,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: config.temperature,
                top_k: config.top_k,
                top_p: config.top_p,
            },
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatTransport for GeminiChat {
    async fn send_message_stream(&self, text: &str) -> CoreResult<mpsc::Receiver<CoreResult<String>>> {
        let user_turn = Content::text(Some("user"), text);
        let mut contents = self.history.lock().clone();
        contents.push(user_turn.clone());

        let body = GenerateContentRequest {
            contents: &contents,
            system_instruction: self.system_instruction.as_ref(),
            generation_config: &self.generation_config,
        };

        let request = self
            .http
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send();
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| CoreError::Transport("timed out waiting for the chat stream".to_string()))??;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CoreError::Transport(format!("chat request failed with {}: {}", status, detail)));
        }

        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut reply = String::new();

            loop {
                let (payloads, finished) = match bytes.next().await {
                    Some(Ok(chunk)) => (decoder.push(&chunk), false),
                    Some(Err(e)) => {
                        warn!(error = %e, "Chat stream interrupted");
                        let _ = tx.send(Err(CoreError::from(e))).await;
                        return;
                    }
                    None => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
                };

                for payload in payloads {
                    match serde_json::from_str::<GenerateContentResponse>(&payload) {
                        Ok(response) => {
                            if let Some(error) = response.error.as_ref() {
                                let _ = tx.send(Err(CoreError::Transport(error.message.clone()))).await;
                                return;
                            }
                            let delta = response.text();
                            if delta.is_empty() {
                                continue;
                            }
                            reply.push_str(&delta);
                            if tx.send(Ok(delta)).await.is_err() {
                                debug!("Chat turn receiver dropped, abandoning stream");
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(CoreError::from(e))).await;
                            return;
                        }
                    }
                }

                if finished {
                    break;
                }
            }

            let mut history = history.lock();
            history.push(user_turn);
            history.push(Content::text(Some("model"), reply));
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_and_generation_settings() {
        let config = ChatConfig {
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.2,
            top_k: 8,
            top_p: 0.5,
            system_instruction: "  ".to_string(),
        };
        let chat = GeminiChat::new(
            reqwest::Client::new(),
            "https://example.test/v1beta/",
            "key",
            Duration::from_secs(5),
            &config,
        );

        assert_eq!(
            chat.endpoint(),
            "https://example.test/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
        assert!(chat.system_instruction.is_none());
        assert_eq!(chat.generation_config.top_k, 8);
    }

    use serde_json::Value;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const STREAM_PATH: &str = "/models/gemini-test:streamGenerateContent";

    fn sse_body(payloads: &[&str]) -> String {
        payloads.iter().map(|p| format!("data: {}\r\n\r\n", p)).collect()
    }

    fn delta(text: &str) -> String {
        serde_json::json!({
            "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
        })
        .to_string()
    }

    fn chat_for(server: &MockServer) -> GeminiChat {
        let config = ChatConfig {
            model: "gemini-test".to_string(),
            system_instruction: "You are a portfolio assistant.".to_string(),
            ..ChatConfig::default()
        };
        GeminiChat::new(reqwest::Client::new(), &server.uri(), "test-key", Duration::from_secs(5), &config)
    }

    async fn collect(mut rx: mpsc::Receiver<CoreResult<String>>) -> (Vec<String>, Option<CoreError>) {
        let mut deltas = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                Ok(delta) => deltas.push(delta),
                Err(e) => return (deltas, Some(e)),
            }
        }
        (deltas, None)
    }

    async fn request_bodies(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|request| request.body_json::<Value>().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_sse_deltas_stream_in_order() {
        let server = MockServer::start().await;
        let body = sse_body(&[&delta("I build "), &delta("with Rust."), r#"{"candidates":[]}"#]);
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let chat = chat_for(&server);
        let (deltas, error) = collect(chat.send_message_stream("What do you build with?").await.unwrap()).await;

        assert!(error.is_none());
        assert_eq!(deltas, vec!["I build ", "with Rust."]);

        let sent = &request_bodies(&server).await[0];
        assert_eq!(sent["contents"][0]["role"], "user");
        assert_eq!(sent["contents"][0]["parts"][0]["text"], "What do you build with?");
        assert_eq!(sent["systemInstruction"]["parts"][0]["text"], "You are a portfolio assistant.");
        assert_eq!(sent["generationConfig"]["topK"], 40);
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exhausted"))
            .mount(&server)
            .await;

        let chat = chat_for(&server);
        match chat.send_message_stream("hello").await {
            Err(CoreError::Transport(message)) => {
                assert!(message.contains("429"));
                assert!(message.contains("quota exhausted"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("a 429 must not open a stream"),
        }
        assert!(chat.history.lock().is_empty());
    }

    #[tokio::test]
    async fn test_error_payload_after_deltas_ends_the_turn() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            &delta("Partial "),
            r#"{"error":{"code":500,"message":"backend overloaded"}}"#,
            &delta("never delivered"),
        ]);
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let chat = chat_for(&server);
        let (deltas, error) = collect(chat.send_message_stream("hello").await.unwrap()).await;

        assert_eq!(deltas, vec!["Partial "]);
        match error {
            Some(CoreError::Transport(message)) => assert_eq!(message, "backend overloaded"),
            other => panic!("expected a transport error, got {:?}", other.map(|e| e.to_string())),
        }
        assert!(chat.history.lock().is_empty());
    }

    #[tokio::test]
    async fn test_history_grows_only_with_completed_turns() {
        let server = MockServer::start().await;
        // Answers the first request only, ahead of the success mock
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(STREAM_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body(&[&delta("Hi there.")]), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let chat = chat_for(&server);
        assert!(chat.send_message_stream("lost turn").await.is_err());
        let (first, _) = collect(chat.send_message_stream("first").await.unwrap()).await;
        assert_eq!(first, vec!["Hi there."]);
        let (second, _) = collect(chat.send_message_stream("second").await.unwrap()).await;
        assert_eq!(second, vec!["Hi there."]);

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies.len(), 3);
        let last: Vec<_> = bodies[2]["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| (c["role"].as_str().unwrap(), c["parts"][0]["text"].as_str().unwrap()))
            .collect();
        assert_eq!(
            last,
            vec![("user", "first"), ("model", "Hi there."), ("user", "second")]
        );
        assert_eq!(chat.history.lock().len(), 4);
    }
}
