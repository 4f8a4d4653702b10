mod availability;
mod bridge;
mod config;
mod db_types;
mod error;
mod handlers;
mod memory_repository;
mod pg_repository;
mod queue;
mod realtime;
mod recording;
mod realtime_types;
mod repository;
mod session;
#[cfg(test)]
mod test_support;
mod tools;
mod transcript;
mod twilio;
mod twilio_api;
mod twilio_types;
mod types;
mod utils;
mod workflow;

use crate::config::Config;
use crate::error::handle_error;
use crate::memory_repository::MemoryRepository;
use crate::pg_repository::PgRepository;
use crate::repository::Repository;
use crate::session::SessionManager;
use crate::twilio_api::TwilioApi;
use crate::types::{AppState, CloseReason, PendingStreams};

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*};

pub mod consts {
    pub const APP_GREETING: &str = "Hello, this is the care team scheduling line. \
                                    One moment while I connect you.";
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    let level = config
        .as_ref()
        .ok()
        .and_then(|c| c.log_level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::DEBUG);
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("carecall_rs", level),
        ]));
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to install tracing subscriber");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error=%e, "invalid configuration");
            std::process::exit(1);
        }
    };
    debug!(config=?config, "loaded configuration");

    let repo: Arc<dyn Repository> = match &config.database_url {
        Some(url) => match PgRepository::connect(url).await {
            Ok(repo) => Arc::new(repo),
            Err(e) => {
                handle_error(e).await;
                std::process::exit(1);
            }
        },
        None => {
            warn!("DATABASE_URL not set, scheduling data lives in memory");
            let repo = MemoryRepository::new();
            if let Some(path) = &config.seed_file {
                if let Err(e) = repo.load_seed_file(path) {
                    handle_error(e).await;
                    std::process::exit(1);
                }
            }
            Arc::new(repo)
        }
    };

    let sessions = Arc::new(SessionManager::new(repo, config.session.clone()));
    let twilio_api = TwilioApi::new(
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
    );
    let bind_addr = config.bind_addr;
    let streams = PendingStreams::new(config.stream_cache_ttl);
    let app_state = Arc::new(AppState {
        config,
        sessions: sessions.clone(),
        twilio_api,
        streams,
    });

    let app = Router::new()
        .route("/twilio/twiml/start", post(handlers::twiml_start_connect))
        .route("/media-stream", get(handlers::media_stream_handler))
        .route("/calls/:session_id/audio/:speaker", get(handlers::call_audio))
        .route("/", get(handlers::health))
        .with_state(app_state);

    info!(addr=%bind_addr, "listening");
    let server = axum::Server::bind(&bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error=%e, "server error");
    }

    info!(active = sessions.active_count(), "shutting down");
    sessions.close_all(CloseReason::Shutdown).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error=%e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
