//! # Health Endpoint
//!
//! `GET /health` and `GET /api/v1/health` report process uptime, the state of
//! both session sub-machines and a short summary of the conversation.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let sessions = state.controller.session_state();
    let snapshot = state.controller.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "chat": sessions.chat,
            "live": sessions.live,
            "chat_model": config.chat.model,
            "live_model": config.backend.live_model,
            "api_key_configured": !config.backend.api_key.is_empty()
        },
        "conversation": {
            "messages": snapshot.messages.len(),
            "topics": snapshot.topics.len(),
            "is_loading": snapshot.is_loading,
            "live_mode": snapshot.live_mode,
            "push_connections": state.push_connections()
        },
        "memory": get_memory_info()
    }))
}

/// Resident and virtual memory of this process, where the platform exposes it.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
