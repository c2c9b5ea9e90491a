//! # Realtime Voice Backend - Main Application Entry Point
//!
//! WebSocket server for real-time voice conversations: clients stream
//! microphone audio in, the server streams transcripts, generated text, and
//! synthesized speech back.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared application state and request metrics
//! - **gateway**: WebSocket transport actor and connection admission
//! - **voice**: Per-connection session state machine and session registry
//! - **speech**: Recognition, sentence segmentation, and synthesis
//! - **generation**: Streaming text-generation forwarder
//! - **health**: System health monitoring endpoints
//! - **middleware**: Request logging and metrics
//! - **handlers**: HTTP request handlers
//! - **error**: Custom error types and HTTP error responses

mod config;
mod error;
mod gateway;
mod generation;
mod handlers;
mod health;
mod middleware;
mod speech;
mod state;
mod voice;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use generation::HttpGenerator;
use speech::{HttpSynthesizer, WsRecognizer};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice::{EngineClients, SessionRegistry};

/// Global shutdown flag set by the signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting realtime-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );
    if config.generation.endpoint.is_empty() {
        info!("No generation endpoint configured, running in echo mode");
    }

    // Shared state: config + metrics, the per-user session registry, and one
    // set of vendor clients reused by every session.
    let app_state = AppState::new(config.clone());
    let registry = web::Data::new(SessionRegistry::new(config.session.max_sessions_per_user));
    let engines = web::Data::new(EngineClients {
        recognizer: Arc::new(WsRecognizer::new()),
        generator: Arc::new(HttpGenerator::new(config.generation.clone())),
        synthesizer: Arc::new(HttpSynthesizer::new()),
    });

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
            .app_data(registry.clone())
            .app_data(engines.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::RequestObserver)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice", web::get().to(gateway::voice_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging.
///
/// `RUST_LOG` controls the filter; without it the server logs its own crate
/// at debug and actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

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
