//! # Settings Handlers
//!
//! Read and partially update the chat settings, list the model catalog.

use crate::{config::GeminiModel, error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "chat": config.chat,
            "live": {
                "model": config.backend.live_model,
                "voice_name": config.backend.voice_name,
                "audio_host": config.live.audio_host,
                "output_sample_rate": config.live.output_sample_rate
            },
            "conversation": {
                "inactivity_timeout_secs": config.conversation.inactivity_timeout_secs
            }
        }
    })))
}

/// `PUT /api/v1/config`: partial update of the chat settings.
///
/// The chat session is re-established only if the effective settings changed;
/// `restarted` in the response tells which.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut chat = state.get_config().chat;
    chat.apply_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    let restarted = state
        .update_chat_config(chat.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "restarted": restarted,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": chat
    })))
}

pub async fn list_models(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let current = state.get_config().chat.model;
    let models: Vec<_> = GeminiModel::ALL
        .iter()
        .map(|model| {
            json!({
                "id": model.id(),
                "name": format!("{:?}", model),
                "text_chat": model.supports_text_chat(),
                "selected": model.id() == current
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "models": models })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeBackend;
    use crate::state::testing::app_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_partial_update_keeps_other_fields() {
        let backend = FakeBackend::new();
        let state = app_state(&backend);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "temperature": 0.2 }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["restarted"], true);
        let chat = state.controller.chat_config();
        assert!((chat.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(chat.top_k, 40);
        assert_eq!(state.get_config().chat, chat);
    }

    #[actix_web::test]
    async fn test_same_settings_do_not_restart_chat() {
        let backend = FakeBackend::new();
        let state = app_state(&backend);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "topK": 40 }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["restarted"], false);
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let backend = FakeBackend::new();
        let state = app_state(&backend);
        let before = state.controller.chat_config();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "top_p": 0.0 }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.controller.chat_config(), before);
    }

    #[actix_web::test]
    async fn test_models_mark_current_selection() {
        let backend = FakeBackend::new();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(&backend)))
                .route("/models", web::get().to(list_models)),
        )
        .await;

        let req = test::TestRequest::get().uri("/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let models = body["models"].as_array().cloned().unwrap_or_default();

        assert_eq!(models.len(), GeminiModel::ALL.len());
        let selected: Vec<_> = models.iter().filter(|m| m["selected"] == true).collect();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["id"], GeminiModel::Flash.id());
    }
}
