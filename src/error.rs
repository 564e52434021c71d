//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **CoreError**: failures of the chat/live core (codec, transport, devices).
//!   These never crash a session; the conversation controller downgrades them
//!   into visible state (an errored chat turn, a live error status).
//! - **AppError**: the HTTP boundary. Every handler returns `Result<_, AppError>`
//!   and actix turns it into a JSON error response.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "conflict",
//!     "message": "a live session is already active",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Failures raised by the session client, the audio pipeline and the codec.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Chat was used before `start_chat`
    #[error("chat session not initialized")]
    NotInitialized,

    /// Network or stream failure mid-turn / mid-session
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound audio payload is not valid base64
    #[error("malformed audio payload: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Byte length does not divide into whole 16-bit frames
    #[error("audio payload of {len} bytes is not a multiple of {frame_bytes} bytes")]
    Format { len: usize, frame_bytes: usize },

    /// Microphone access was refused
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Audio hardware or audio context failure
    #[error("audio device error: {0}")]
    Device(String),

    /// A second live session was requested while one is still open
    #[error("a live session is already active")]
    LiveSessionActive,

    /// The live session was stopped before it finished starting
    #[error("live session start was cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Transport(format!("unexpected payload: {}", err))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned to the UI shell over HTTP.
///
/// ## Status Code Mapping:
/// - Internal → 500
/// - BadRequest/ValidationError → 400
/// - Forbidden → 403
/// - NotFound → 404
/// - Conflict → 409
/// - Upstream → 502
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::LiveSessionActive | CoreError::Cancelled => AppError::Conflict(message),
            CoreError::PermissionDenied(_) => AppError::Forbidden(message),
            CoreError::Transport(_) => AppError::Upstream(message),
            CoreError::Decode(_) | CoreError::Format { .. } => AppError::BadRequest(message),
            CoreError::NotInitialized | CoreError::Device(_) => AppError::Internal(message),
        }
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_to_status_codes() {
        let conflict: AppError = CoreError::LiveSessionActive.into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let forbidden: AppError = CoreError::PermissionDenied("blocked".to_string()).into();
        assert_eq!(forbidden.status_code(), StatusCode::FORBIDDEN);

        let upstream: AppError = CoreError::Transport("reset".to_string()).into();
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);

        let cancelled: AppError = CoreError::Cancelled.into();
        assert_eq!(cancelled.status_code(), StatusCode::CONFLICT);

        let format: AppError = CoreError::Format { len: 3, frame_bytes: 2 }.into();
        assert_eq!(format.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_body() {
        let err = AppError::ValidationError("top_p must be in (0, 1]".to_string());
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("top_p"));
    }
}
