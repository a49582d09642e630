// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint heartbeat monitor.
//!
//! Every cycle the monitor probes each registered endpoint with a
//! `get_keyword_names` call through its proxy slot. A successful probe
//! moves Offline -> Online, a failed one (no slot, timeout, disconnect,
//! remote fault) moves Online -> Offline. Forbidden and Unauthorized rows
//! are never touched; per-endpoint errors are swallowed so one broken
//! endpoint cannot stall the sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};
use uuid::Uuid;

use testplane_core::{EndpointStatus, Store};
use testplane_proxy::{ProxyRegistry, proxy_path};

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to sweep all endpoints.
    pub poll_interval: Duration,
    /// Budget of one RPC probe.
    pub probe_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Background worker toggling endpoint Online/Offline status.
pub struct HeartbeatMonitor {
    store: Arc<dyn Store>,
    registry: Arc<ProxyRegistry>,
    config: HeartbeatConfig,
    shutdown: Arc<Notify>,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ProxyRegistry>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the heartbeat loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            probe_timeout_secs = self.config.probe_timeout.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Heartbeat monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// Probe every endpoint once.
    pub async fn sweep(&self) {
        let endpoints = match self.store.list_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(error = %e, "failed to list endpoints for heartbeat sweep");
                return;
            }
        };
        for endpoint in endpoints {
            // Authorization states are admin territory, not liveness.
            if matches!(
                endpoint.status,
                EndpointStatus::Forbidden | EndpointStatus::Unauthorized
            ) {
                continue;
            }
            if let Err(e) = probe_endpoint(
                &self.store,
                &self.registry,
                endpoint.uid,
                self.config.probe_timeout,
            )
            .await
            {
                error!(endpoint = %endpoint.uid, error = %e, "heartbeat probe errored");
            }
        }
    }
}

/// Probe one endpoint and persist an Online/Offline transition if its
/// status changed. Returns whether the endpoint answered.
pub async fn probe_endpoint(
    store: &Arc<dyn Store>,
    registry: &Arc<ProxyRegistry>,
    uid: Uuid,
    timeout: Duration,
) -> testplane_core::Result<bool> {
    let path = proxy_path(&uid.to_string(), "");
    let alive = match registry.get(&path) {
        None => {
            debug!(endpoint = %uid, "no proxy slot registered");
            false
        }
        Some(slot) => {
            match slot
                .call("get_keyword_names", serde_json::json!([]), timeout)
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    debug!(endpoint = %uid, error = %e, "probe call failed");
                    false
                }
            }
        }
    };

    if alive {
        if store
            .set_endpoint_status_if(uid, EndpointStatus::Offline, EndpointStatus::Online)
            .await?
        {
            info!(endpoint = %uid, "endpoint is back online");
        }
    } else if store
        .set_endpoint_status_if(uid, EndpointStatus::Online, EndpointStatus::Offline)
        .await?
    {
        error!(endpoint = %uid, "endpoint went offline");
    }
    Ok(alive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testplane_core::{EndpointRecord, MemoryStore};
    use testplane_proxy::{ProxySlot, RpcRequest, RpcResponse};
    use tokio::sync::mpsc;

    fn stores() -> (Arc<dyn Store>, Arc<ProxyRegistry>) {
        (
            Arc::new(MemoryStore::new()),
            Arc::new(ProxyRegistry::new()),
        )
    }

    async fn endpoint_with_status(store: &Arc<dyn Store>, status: EndpointStatus) -> Uuid {
        let mut endpoint = EndpointRecord::new(Uuid::new_v4(), "org-1", None);
        endpoint.status = status;
        store.insert_endpoint(&endpoint).await.unwrap();
        endpoint.uid
    }

    fn answering_slot(uid: Uuid) -> (Arc<ProxySlot>, tokio::task::JoinHandle<()>) {
        let (slot, mut rx): (_, mpsc::Receiver<RpcRequest>) =
            ProxySlot::channel(proxy_path(&uid.to_string(), ""));
        let responder = {
            let slot = slot.clone();
            tokio::spawn(async move {
                while let Some(request) = rx.recv().await {
                    slot.complete(RpcResponse::result(request.id, serde_json::json!([])));
                }
            })
        };
        (slot, responder)
    }

    #[tokio::test]
    async fn test_successful_probe_marks_online() {
        let (store, registry) = stores();
        let uid = endpoint_with_status(&store, EndpointStatus::Offline).await;
        let (slot, _responder) = answering_slot(uid);
        registry.register(slot);

        let alive = probe_endpoint(&store, &registry, uid, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(alive);
        assert_eq!(
            store.endpoint(uid).await.unwrap().unwrap().status,
            EndpointStatus::Online
        );
    }

    #[tokio::test]
    async fn test_missing_slot_marks_offline() {
        let (store, registry) = stores();
        let uid = endpoint_with_status(&store, EndpointStatus::Online).await;

        let alive = probe_endpoint(&store, &registry, uid, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!alive);
        assert_eq!(
            store.endpoint(uid).await.unwrap().unwrap().status,
            EndpointStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_dead_slot_marks_offline() {
        let (store, registry) = stores();
        let uid = endpoint_with_status(&store, EndpointStatus::Online).await;
        let (slot, rx) = ProxySlot::channel(proxy_path(&uid.to_string(), ""));
        drop(rx); // connection torn down
        registry.register(slot);

        let alive = probe_endpoint(&store, &registry, uid, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!alive);
        assert_eq!(
            store.endpoint(uid).await.unwrap().unwrap().status,
            EndpointStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_sweep_never_touches_forbidden_or_unauthorized() {
        let (store, registry) = stores();
        let forbidden = endpoint_with_status(&store, EndpointStatus::Forbidden).await;
        let unauthorized = endpoint_with_status(&store, EndpointStatus::Unauthorized).await;

        let monitor = HeartbeatMonitor::new(
            store.clone(),
            registry,
            HeartbeatConfig {
                poll_interval: Duration::from_secs(30),
                probe_timeout: Duration::from_millis(50),
            },
        );
        monitor.sweep().await;

        assert_eq!(
            store.endpoint(forbidden).await.unwrap().unwrap().status,
            EndpointStatus::Forbidden
        );
        assert_eq!(
            store.endpoint(unauthorized).await.unwrap().unwrap().status,
            EndpointStatus::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_online_stays_online_without_a_write() {
        let (store, registry) = stores();
        let uid = endpoint_with_status(&store, EndpointStatus::Online).await;
        let (slot, _responder) = answering_slot(uid);
        registry.register(slot);

        let alive = probe_endpoint(&store, &registry, uid, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(alive);
        assert_eq!(
            store.endpoint(uid).await.unwrap().unwrap().status,
            EndpointStatus::Online
        );
    }
}
