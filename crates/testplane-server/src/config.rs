// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Testplane server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Address of the HTTP/websocket server (REST, `/rpc`, `/msg`, `/ws`)
    pub http_addr: SocketAddr,
    /// Address of the local XML-RPC facade
    pub facade_addr: SocketAddr,
    /// Root directory for scripts, uploads and results
    pub data_dir: PathBuf,
    /// Test runner executable launched per task
    pub runner_program: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TESTPLANE_DATABASE_URL`: PostgreSQL connection string; the
    ///   in-memory store is used when unset
    /// - `TESTPLANE_HTTP_PORT`: HTTP/websocket port (default: 5000)
    /// - `TESTPLANE_FACADE_PORT`: XML-RPC facade port (default: 8270)
    /// - `TESTPLANE_DATA_DIR`: data directory (default: `.data`)
    /// - `TESTPLANE_RUNNER`: test runner executable (default: `robot`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TESTPLANE_DATABASE_URL").ok();

        let http_port: u16 = std::env::var("TESTPLANE_HTTP_PORT")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TESTPLANE_HTTP_PORT", "must be a valid port number")
            })?;

        let facade_port: u16 = std::env::var("TESTPLANE_FACADE_PORT")
            .unwrap_or_else(|_| "8270".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TESTPLANE_FACADE_PORT", "must be a valid port number")
            })?;

        let data_dir = PathBuf::from(
            std::env::var("TESTPLANE_DATA_DIR").unwrap_or_else(|_| ".data".to_string()),
        );

        let runner_program =
            std::env::var("TESTPLANE_RUNNER").unwrap_or_else(|_| "robot".to_string());

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            facade_addr: SocketAddr::from(([0, 0, 0, 0], facade_port)),
            data_dir,
            runner_program,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            facade_addr: SocketAddr::from(([0, 0, 0, 0], 8270)),
            data_dir: PathBuf::from(".data"),
            runner_program: "robot".to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
