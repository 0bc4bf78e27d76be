//! Server configuration loaded from the environment, mirroring the
//! `Config::from_env` pattern of a typical axum service: every knob has a
//! sane default, and a malformed value is a startup-time error rather than
//! a silently-ignored one.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_path: String,
    /// When set, clients must present this token in their `auth` message.
    pub auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = match std::env::var("SYNC_SERVER_BIND") {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue { key: "SYNC_SERVER_BIND", value: v })?,
            Err(_) => "0.0.0.0:8787".parse().unwrap(),
        };
        let database_path = std::env::var("SYNC_SERVER_DB_PATH").unwrap_or_else(|_| "sync-server.db".to_string());
        let auth_token = std::env::var("SYNC_SERVER_AUTH_TOKEN").ok().filter(|s| !s.is_empty());

        Ok(Self { bind_addr, database_path, auth_token })
    }
}
