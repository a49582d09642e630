// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for testplane-server.
//!
//! Wires the shared context, the event dispatcher, the heartbeat monitor,
//! the HTTP/websocket server and the XML-RPC facade together, so the binary
//! and the integration tests start the whole plane the same way.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use testplane_core::MemoryStore;
//! use testplane_server::runner::ProcessRunner;
//! use testplane_server::runtime::ServerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ServerRuntime::builder()
//!         .store(Arc::new(MemoryStore::new()))
//!         .runner(Arc::new(ProcessRunner::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use testplane_core::Store;
use testplane_proxy::facade;

use crate::api;
use crate::config::Config;
use crate::context::ServerContext;
use crate::events::EventDispatcher;
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::hub;
use crate::runner::Runner;

/// Builder for a [`ServerRuntime`].
pub struct ServerRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    runner: Option<Arc<dyn Runner>>,
    config: Config,
    heartbeat: HeartbeatConfig,
}

impl Default for ServerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            runner: None,
            config: Config::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ServerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store backend (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the test runner backend (required).
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Override the heartbeat cadence (tests shorten it).
    pub fn heartbeat_config(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Validate the builder.
    pub fn build(self) -> Result<ServerRuntimeConfig> {
        let store = self.store.ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner is required"))?;
        Ok(ServerRuntimeConfig {
            store,
            runner,
            config: self.config,
            heartbeat: self.heartbeat,
        })
    }
}

/// Validated runtime configuration.
pub struct ServerRuntimeConfig {
    store: Arc<dyn Store>,
    runner: Arc<dyn Runner>,
    config: Config,
    heartbeat: HeartbeatConfig,
}

impl ServerRuntimeConfig {
    /// Start every component and return the running plane.
    pub async fn start(self) -> Result<ServerRuntime> {
        let ctx = ServerContext::new(self.store, self.runner, &self.config).await?;

        // Locks left behind by a previous process would starve every pop.
        match ctx.store.reset_queue_locks().await {
            Ok(0) => {}
            Ok(cleared) => info!(cleared, "reset stale queue locks"),
            Err(e) => warn!(error = %e, "failed to reset queue locks"),
        }

        let dispatcher = EventDispatcher::new(ctx.clone());
        let dispatcher_shutdown = dispatcher.shutdown_handle();
        let dispatcher_handle = tokio::spawn(async move { dispatcher.run().await });

        let heartbeat = HeartbeatMonitor::new(
            ctx.store.clone(),
            ctx.registry.clone(),
            self.heartbeat.clone(),
        );
        let heartbeat_shutdown = heartbeat.shutdown_handle();
        let heartbeat_handle = tokio::spawn(async move { heartbeat.run().await });

        let http_listener = tokio::net::TcpListener::bind(self.config.http_addr).await?;
        let http_addr = http_listener.local_addr()?;
        let app = api::router(ctx.clone()).merge(hub::router(ctx.clone()));
        let http_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                error!(error = %e, "HTTP server stopped");
            }
        });
        info!(addr = %http_addr, "HTTP/websocket server listening");

        let facade_listener = tokio::net::TcpListener::bind(self.config.facade_addr).await?;
        let facade_addr = facade_listener.local_addr()?;
        let facade_app = facade::router(ctx.registry.clone(), facade::CALL_TIMEOUT);
        let facade_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(facade_listener, facade_app).await {
                error!(error = %e, "XML-RPC facade stopped");
            }
        });
        info!(addr = %facade_addr, "XML-RPC facade listening");

        Ok(ServerRuntime {
            ctx,
            http_addr,
            facade_addr,
            dispatcher_shutdown,
            heartbeat_shutdown,
            dispatcher_handle,
            heartbeat_handle,
            http_handle,
            facade_handle,
        })
    }
}

/// A running testplane server.
pub struct ServerRuntime {
    ctx: Arc<ServerContext>,
    http_addr: SocketAddr,
    facade_addr: SocketAddr,
    dispatcher_shutdown: Arc<tokio::sync::Notify>,
    heartbeat_shutdown: Arc<tokio::sync::Notify>,
    dispatcher_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
    http_handle: JoinHandle<()>,
    facade_handle: JoinHandle<()>,
}

impl ServerRuntime {
    /// Create a new builder.
    pub fn builder() -> ServerRuntimeBuilder {
        ServerRuntimeBuilder::new()
    }

    /// Bound address of the HTTP/websocket server.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Bound address of the XML-RPC facade.
    pub fn facade_addr(&self) -> SocketAddr {
        self.facade_addr
    }

    /// Shared state, for embedding and tests.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Gracefully stop the background loops and drop the listeners.
    pub async fn shutdown(self) -> Result<()> {
        info!("ServerRuntime shutting down...");
        self.dispatcher_shutdown.notify_waiters();
        self.heartbeat_shutdown.notify_waiters();

        let _ = self.dispatcher_handle.await;
        let _ = self.heartbeat_handle.await;
        self.http_handle.abort();
        self.facade_handle.abort();

        info!("ServerRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use testplane_core::MemoryStore;

    fn test_config() -> Config {
        Config {
            http_addr: "127.0.0.1:0".parse().unwrap(),
            facade_addr: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        }
    }

    #[test]
    fn test_builder_requires_store_and_runner() {
        assert!(ServerRuntime::builder().build().is_err());
        assert!(
            ServerRuntime::builder()
                .store(Arc::new(MemoryStore::new()))
                .build()
                .is_err()
        );
        assert!(
            ServerRuntime::builder()
                .store(Arc::new(MemoryStore::new()))
                .runner(Arc::new(MockRunner::new()))
                .build()
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let runtime = ServerRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .runner(Arc::new(MockRunner::new()))
            .config(test_config())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_ne!(runtime.http_addr().port(), 0);
        assert_ne!(runtime.facade_addr().port(), 0);
        runtime.shutdown().await.unwrap();
    }
}
