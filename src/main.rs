//! # ASR Realtime Server - Main Application Entry Point
//!
//! WebSocket server that turns streamed PCM16 audio into live transcripts
//! using the realtime event protocol (`session.update`,
//! `input_audio_buffer.append`, `conversation.item.input_audio_transcription.*`).
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared state, metrics and the session registry
//! - **audio**: PCM decoding, the session audio buffer, VAD and chunking
//! - **session**: per-connection session state machine
//! - **transcription**: inference jobs, backend client and the shared scheduler
//! - **protocol**: wire events in both directions
//! - **websocket**: the actor binding one connection to one session
//! - **health**: service descriptor, health and metrics endpoints
//! - **handlers**: runtime configuration endpoints
//! - **middleware**: request logging
//! - **error**: session and HTTP error types

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod session;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use crate::transcription::{InferenceScheduler, SchedulerOptions};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        backend = %config.backend.provider,
        model = %config.backend.model,
        max_sessions = config.session.max_concurrent_sessions,
        max_inferences = config.backend.max_concurrent_inferences,
        "Configuration loaded"
    );

    let backend = transcription::backend::from_config(&config.backend)?;
    let backend_name = backend.name();
    let scheduler = InferenceScheduler::start(backend, SchedulerOptions::from_config(&config.backend));

    let app_state = AppState::new(config.clone(), scheduler, backend_name);
    let bind_addr = config.bind_addr();
    let ws_path = config.server.ws_path.clone();

    info!("Listening on {} (realtime endpoint {})", bind_addr, ws_path);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .route("/", web::get().to(health::service_info))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config))
            .route("/config", web::put().to(handlers::update_config))
            .route(&ws_path, web::get().to(websocket::realtime_websocket))
    })
    .bind(&bind_addr)?
    .disable_signals()
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
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
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
                .unwrap_or_else(|_| "asr_realtime_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
