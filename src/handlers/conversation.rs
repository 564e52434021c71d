//! # Conversation Handlers
//!
//! HTTP entry points for the UI shell. Replies are not returned inline:
//! `POST /api/v1/messages` accepts the message and the streamed reply reaches
//! the shell through `/ws/conversation` snapshots.

use crate::{
    conversation::SendRejection,
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub text: String,
}

pub async fn get_conversation(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.controller.snapshot()))
}

pub async fn post_message(
    state: web::Data<AppState>,
    body: web::Json<MessageRequest>,
) -> AppResult<HttpResponse> {
    // Reserves the turn before returning, so a second request sees it
    let pending = state
        .controller
        .accept_user_message(&body.into_inner().text)
        .map_err(|rejection| match rejection {
            SendRejection::Blank => AppError::BadRequest("Message text must not be empty".to_string()),
            SendRejection::Busy => AppError::Conflict("A reply is still streaming".to_string()),
        })?;
    actix_web::rt::spawn(pending.stream());

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub async fn start_live(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    info!("Live session requested");
    state.controller.start_live_session().await?;
    Ok(HttpResponse::Ok().json(state.controller.snapshot()))
}

pub async fn stop_live(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    info!("Live session stop requested");
    state.controller.stop_live_session().await;
    Ok(HttpResponse::Ok().json(state.controller.snapshot()))
}
