// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Testplane Server - control plane binary.

use std::sync::Arc;

use tracing::{info, warn};

use testplane_core::{MemoryStore, PostgresStore, Store};
use testplane_server::config::Config;
use testplane_server::runner::ProcessRunner;
use testplane_server::runtime::ServerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testplane=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    info!(
        http_addr = %config.http_addr,
        facade_addr = %config.facade_addr,
        data_dir = %config.data_dir.display(),
        runner = %config.runner_program,
        "Starting Testplane"
    );

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            let store = PostgresStore::new(pool);
            store.ensure_schema().await?;
            info!("Connected to database, schema verified");
            Arc::new(store)
        }
        None => {
            warn!("TESTPLANE_DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let runtime = ServerRuntime::builder()
        .store(store)
        .runner(Arc::new(ProcessRunner::new()))
        .config(config)
        .build()?
        .start()
        .await?;

    info!(
        http_addr = %runtime.http_addr(),
        facade_addr = %runtime.facade_addr(),
        "Testplane ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;
    info!("Testplane shut down");

    Ok(())
}
