//! # Persona Live Chat - Server Entry Point
//!
//! Runs the conversation core behind an Actix-web server so a UI shell can
//! drive it over HTTP and follow it over a WebSocket.
//!
//! ## Startup:
//! 1. Load `.env`, set up tracing, load and validate configuration
//! 2. Build the Gemini backend, the session client and the audio host
//! 3. Create the conversation controller and the shared `AppState`
//! 4. Serve until SIGINT/SIGTERM, then release the live session and stop
//!
//! ## Routes:
//! - `GET /health`, `GET /api/v1/health`
//! - `GET|PUT /api/v1/config`, `GET /api/v1/models`
//! - `GET /api/v1/conversation`, `POST /api/v1/messages`
//! - `POST /api/v1/live/start`, `POST /api/v1/live/stop`
//! - `GET /ws/conversation`

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use persona_live_chat::audio::device::{AudioHost, NullHost};
use persona_live_chat::config::{AppConfig, AudioHostKind};
use persona_live_chat::conversation::ConversationController;
use persona_live_chat::session::gemini::GeminiBackend;
use persona_live_chat::session::SessionClient;
use persona_live_chat::state::AppState;
use persona_live_chat::{handlers, health, websocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting persona-live-chat v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        chat_model = %config.chat.model,
        live_model = %config.backend.live_model,
        "Configuration loaded"
    );

    let backend = GeminiBackend::new(config.backend.clone())?;
    let client = Arc::new(SessionClient::new(Arc::new(backend)));
    let controller = ConversationController::new(
        client,
        select_audio_host(config.live.audio_host),
        config.chat.clone(),
        config.live.clone(),
        config.conversation.clone(),
    );

    let app_state = AppState::new(config.clone(), controller.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/models", web::get().to(handlers::list_models))
                    .route("/conversation", web::get().to(handlers::get_conversation))
                    .route("/messages", web::post().to(handlers::post_message))
                    .route("/live/start", web::post().to(handlers::start_live))
                    .route("/live/stop", web::post().to(handlers::stop_live)),
            )
            .route("/ws/conversation", web::get().to(websocket::conversation_websocket))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::route().to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            controller.shutdown().await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persona_live_chat=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn select_audio_host(kind: AudioHostKind) -> Arc<dyn AudioHost> {
    match kind {
        AudioHostKind::Null => {
            info!("Using headless audio host");
            Arc::new(NullHost::new())
        }
        #[cfg(feature = "cpal-host")]
        AudioHostKind::Cpal => {
            info!("Using cpal audio host");
            Arc::new(persona_live_chat::audio::cpal_host::CpalHost::new())
        }
        #[cfg(not(feature = "cpal-host"))]
        AudioHostKind::Cpal => {
            tracing::warn!("cpal audio host requested but the `cpal-host` feature is disabled, using headless host");
            Arc::new(NullHost::new())
        }
    }
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
