use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// Timers, geometry defaults and frame limits for the relay core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub default_cols: u16,
    pub default_rows: u16,
    pub session_max_age_ms: u64,
    pub producer_reconnect_ms: u64,
    pub viewer_setup_timeout_ms: u64,
    pub spawn_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub closed_session_ring: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub control_token_secret: String,
    pub session_cookie_secret: String,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, AppError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .map_err(|_| AppError::Configuration(format!("{} must be a valid number", key)))
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        // App config
        let app_name = env::var("APP_NAME").unwrap_or_else(|_| "termlink".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        // Server config
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = parse_env::<u16>("SERVER_PORT", "8080")?;

        // CORS origins
        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        // Relay timers and limits
        let default_cols = parse_env::<u16>("DEFAULT_COLS", "80")?;
        let default_rows = parse_env::<u16>("DEFAULT_ROWS", "24")?;
        let session_max_age_ms = parse_env::<u64>("SESSION_MAX_AGE_MS", "3600000")?;
        let producer_reconnect_ms = parse_env::<u64>("PRODUCER_RECONNECT_MS", "30000")?;
        let viewer_setup_timeout_ms = parse_env::<u64>("VIEWER_SETUP_TIMEOUT_MS", "10000")?;
        let spawn_timeout_ms = parse_env::<u64>("SPAWN_TIMEOUT_MS", "15000")?;
        let max_frame_bytes = parse_env::<usize>("MAX_FRAME_BYTES", "1048576")?;
        let closed_session_ring = parse_env::<usize>("CLOSED_SESSION_RING", "50")?;

        // Auth config
        let control_token_secret = env::var("CONTROL_TOKEN_SECRET")
            .map_err(|_| AppError::Configuration("CONTROL_TOKEN_SECRET must be set".to_string()))?;

        let session_cookie_secret = env::var("SESSION_COOKIE_SECRET")
            .unwrap_or_else(|_| control_token_secret.clone());

        Ok(Self {
            app: AppConfig {
                name: app_name,
                environment,
            },
            server: ServerConfig {
                host: server_host,
                port: server_port,
                cors_origins,
            },
            relay: RelayConfig {
                default_cols,
                default_rows,
                session_max_age_ms,
                producer_reconnect_ms,
                viewer_setup_timeout_ms,
                spawn_timeout_ms,
                max_frame_bytes,
                closed_session_ring,
            },
            auth: AuthConfig {
                control_token_secret,
                session_cookie_secret,
            },
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_cols: 80,
            default_rows: 24,
            session_max_age_ms: 3_600_000,
            producer_reconnect_ms: 30_000,
            viewer_setup_timeout_ms: 10_000,
            spawn_timeout_ms: 15_000,
            max_frame_bytes: 1024 * 1024,
            closed_session_ring: 50,
        }
    }
}
