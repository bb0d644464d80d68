//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use huddle_shared::constants::{
    DEFAULT_HISTORY_LIMIT_MAX, DEFAULT_HTTP_PORT, DEFAULT_MAX_MEDIA_SIZE, DEFAULT_MAX_MESSAGE_LEN,
    DEFAULT_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS,
};

/// When a message moves from `Pending` to `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryConfirmation {
    /// As soon as the router starts fanning the message out.
    #[default]
    FanOut,
    /// When a connection of some identity other than the sender acks it.
    Ack,
}

impl DeliveryConfirmation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fanout" | "fan-out" => Some(Self::FanOut),
            "ack" => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file. When unset, state lives only in memory.
    /// Env: `DATABASE_PATH`
    pub database_path: Option<PathBuf>,

    /// Directory where uploaded media blobs are stored.
    /// Env: `MEDIA_STORAGE_PATH`
    /// Default: `./media`
    pub media_storage_path: PathBuf,

    /// Maximum media blob size in bytes.
    /// Env: `MAX_MEDIA_SIZE`
    pub max_media_size: usize,

    /// Ed25519 secret used to sign session tokens (hex-encoded, 64 chars).
    /// Env: `TOKEN_SIGNING_KEY`
    /// Default: a random key per process, so tokens die with the process.
    pub token_signing_key: Option<[u8; 32]>,

    /// Session token lifetime in seconds.
    /// Env: `TOKEN_TTL_SECS`
    pub token_ttl_secs: i64,

    /// Whether new accounts can be registered.
    /// Env: `REGISTRATION_OPEN` (true/false)
    pub registration_open: bool,

    /// Upper bound on messages returned by one history fetch.
    /// Env: `HISTORY_LIMIT_MAX` (`0` disables the cap)
    /// Default: 500
    pub history_limit_max: Option<usize>,

    /// Maximum text length of one message, in characters.
    /// Env: `MAX_MESSAGE_LEN`
    pub max_message_len: usize,

    /// Env: `DELIVERY_CONFIRMATION` (`fanout` | `ack`)
    pub delivery_confirmation: DeliveryConfirmation,

    /// Sustained request rate per client IP / per connection for sends.
    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Burst capacity of the rate limiter.
    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            media_storage_path: PathBuf::from("./media"),
            max_media_size: DEFAULT_MAX_MEDIA_SIZE,
            token_signing_key: None,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            registration_open: true,
            history_limit_max: Some(DEFAULT_HISTORY_LIMIT_MAX),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            delivery_confirmation: DeliveryConfirmation::FanOut,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("MEDIA_STORAGE_PATH") {
            config.media_storage_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("MAX_MEDIA_SIZE") {
            parse_into(&val, "MAX_MEDIA_SIZE", &mut config.max_media_size);
        }

        if let Some(hex_key) = lookup("TOKEN_SIGNING_KEY") {
            match parse_hex_key(&hex_key) {
                Ok(key) => config.token_signing_key = Some(key),
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid TOKEN_SIGNING_KEY, using a random key");
                }
            }
        }

        if let Some(val) = lookup("TOKEN_TTL_SECS") {
            match val.trim().parse::<i64>() {
                Ok(secs) if (1..=MAX_TOKEN_TTL_SECS).contains(&secs) => {
                    config.token_ttl_secs = secs;
                }
                _ => tracing::warn!(
                    value = %val,
                    max = MAX_TOKEN_TTL_SECS,
                    "TOKEN_TTL_SECS must be between 1 and max, using default"
                ),
            }
        }

        if let Some(val) = lookup("REGISTRATION_OPEN") {
            config.registration_open = val != "false" && val != "0";
        }

        if let Some(val) = lookup("HISTORY_LIMIT_MAX") {
            match val.parse::<usize>() {
                Ok(0) => config.history_limit_max = None,
                Ok(n) => config.history_limit_max = Some(n),
                Err(_) => tracing::warn!(value = %val, "Invalid HISTORY_LIMIT_MAX, ignoring"),
            }
        }

        if let Some(val) = lookup("MAX_MESSAGE_LEN") {
            parse_into(&val, "MAX_MESSAGE_LEN", &mut config.max_message_len);
        }

        if let Some(val) = lookup("DELIVERY_CONFIRMATION") {
            match DeliveryConfirmation::parse(&val) {
                Some(mode) => config.delivery_confirmation = mode,
                None => tracing::warn!(value = %val, "Invalid DELIVERY_CONFIRMATION, using fanout"),
            }
        }

        if let Some(val) = lookup("RATE_LIMIT_PER_SEC") {
            parse_into(&val, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        }

        if let Some(val) = lookup("RATE_LIMIT_BURST") {
            parse_into(&val, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, key: &str, slot: &mut T) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(key, value = %value, "Invalid value, using default"),
    }
}

/// Parse a 64-character hex string into a 32-byte key.
fn parse_hex_key(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let bytes = hex::decode(hex_str).map_err(|e| e.to_string())?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
