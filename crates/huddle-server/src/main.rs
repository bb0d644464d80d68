//! # huddle-server
//!
//! Real-time chat coordinator for the Huddle mobile client.
//!
//! This binary provides:
//! - **Identity & sessions**: registration, login and signed session tokens
//! - **Rooms**: public and password-protected rooms with admins, kicks and
//!   invites
//! - **Message log**: ordered per-channel history for rooms and private
//!   pairs, persisted in SQLite
//! - **Delivery**: a WebSocket event channel that fans out messages, room
//!   events and presence to subscribed connections
//! - **REST API** (axum) for accounts, rooms, presence and media blobs

mod api;
mod config;
mod error;
mod hub;
mod identity;
mod media;
mod message_log;
mod persist;
mod presence;
mod rate_limit;
mod rooms;
mod router;
mod session;

use std::sync::Arc;

use anyhow::Context;
use huddle_shared::token::TokenIssuer;
use huddle_store::{EphemeralStore, SqliteStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::{Hub, HubSettings};
use crate::media::MediaStore;
use crate::persist::SharedStore;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,huddle_server=debug")),
        )
        .init();

    info!("Starting Huddle server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = ?config.database_path,
        registration_open = config.registration_open,
        confirmation = ?config.delivery_confirmation,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Durable store, or nothing survives a restart
    let store: SharedStore = match &config.database_path {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("opening database {}", path.display()))?,
        ),
        None => {
            warn!("DATABASE_PATH not set, state is kept in memory only");
            Arc::new(EphemeralStore)
        }
    };

    let ttl = chrono::Duration::seconds(config.token_ttl_secs);
    let issuer = match &config.token_signing_key {
        Some(key) => TokenIssuer::from_secret_bytes(key, ttl),
        None => {
            warn!("TOKEN_SIGNING_KEY not set, sessions end when the process exits");
            TokenIssuer::generate(ttl)
        }
    };

    let hub = Arc::new(Hub::open(store, issuer, HubSettings::from(&config)).await?);

    let media = Arc::new(
        MediaStore::new(config.media_storage_path.clone(), config.max_media_size).await?,
    );

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
    let message_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let http_addr = config.http_addr;
    let app_state = AppState {
        hub,
        media,
        rate_limiter: rate_limiter.clone(),
        message_limiter: message_limiter.clone(),
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_stale(600.0).await;
            message_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
