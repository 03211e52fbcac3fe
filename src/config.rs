//! Server configuration from environment variables, with defaults that let
//! the server start with zero setup for local development.

use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address to listen on.
    /// Env: `BIND_ADDR`. Default: `0.0.0.0:8080`.
    pub bind_addr: SocketAddr,

    /// SQLite connection string.
    /// Env: `DATABASE_URL`. Default: `sqlite://masquerade.db?mode=rwc`.
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 8080).into(),
            database_url: "sqlite://masquerade.db?mode=rwc".to_owned(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.bind_addr = parsed,
                Err(_) => {
                    tracing::warn!(value = %addr, "invalid BIND_ADDR, using default");
                }
            }
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        config
    }
}
