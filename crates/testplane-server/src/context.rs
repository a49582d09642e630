// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared server state.
//!
//! One `ServerContext` is built at startup and handed (behind `Arc`) to the
//! REST handlers, the websocket hub, the event dispatcher, the task loops
//! and the heartbeat monitor. The in-process tables it carries (process
//! table, proxy registry, room hub, wake counters, task-room cache) are the
//! only mutable shared state in the server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use testplane_core::{CoreError, EventQueue, Store};
use testplane_proxy::ProxyRegistry;

use crate::config::Config;
use crate::process_table::ProcessTable;
use crate::rooms::RoomHub;
use crate::runner::Runner;

/// Wake counters of the per-endpoint task loops.
///
/// Absent entry: no loop. 1: loop running, may exit after an idle drain.
/// 2: new work was signalled while the loop was draining. Creation and
/// signalling are serialized by the event dispatcher, so the map mutex only
/// guards against the loops themselves.
#[derive(Default)]
pub struct TaskLoops {
    counters: Mutex<HashMap<Uuid, i64>>,
}

impl TaskLoops {
    /// Whether a loop exists for the endpoint.
    pub async fn is_running(&self, endpoint: Uuid) -> bool {
        self.counters.lock().await.contains_key(&endpoint)
    }

    /// Claim the loop slot. Returns true when the caller must spawn the
    /// loop; false when one runs already and its wake counter was bumped.
    pub async fn claim_or_signal(&self, endpoint: Uuid) -> bool {
        let mut counters = self.counters.lock().await;
        match counters.get_mut(&endpoint) {
            Some(counter) => {
                *counter = 2;
                false
            }
            None => {
                counters.insert(endpoint, 1);
                true
            }
        }
    }

    /// Reset the counter to 1 after a task ran.
    pub async fn mark_active(&self, endpoint: Uuid) {
        self.counters.lock().await.insert(endpoint, 1);
    }

    /// Idle-drain decision: true means exit (slot removed); false means new
    /// work arrived during the drain, counter reset, poll again.
    pub async fn try_exit(&self, endpoint: Uuid) -> bool {
        let mut counters = self.counters.lock().await;
        match counters.get_mut(&endpoint) {
            Some(counter) if *counter != 1 => {
                *counter = 1;
                false
            }
            _ => {
                counters.remove(&endpoint);
                true
            }
        }
    }

    /// Drop the slot unconditionally (endpoint deleted).
    pub async fn remove(&self, endpoint: Uuid) {
        self.counters.lock().await.remove(&endpoint);
    }
}

/// State shared by every server component.
pub struct ServerContext {
    /// Persistence backend.
    pub store: Arc<dyn Store>,
    /// Singleton event queue handle.
    pub events: EventQueue,
    /// Proxy slots of connected endpoints.
    pub registry: Arc<ProxyRegistry>,
    /// Browser fan-out hub.
    pub rooms: Arc<RoomHub>,
    /// Running test children, keyed by task id.
    pub processes: Arc<ProcessTable>,
    /// Test execution backend.
    pub runner: Arc<dyn Runner>,
    /// Task loop wake counters.
    pub loops: TaskLoops,
    /// task id -> room id cache for the message-channel relay.
    pub task_rooms: DashMap<String, String>,
    /// Root of scripts, uploads and results.
    pub data_dir: PathBuf,
    /// Test runner executable.
    pub runner_program: String,
    /// Where the local XML-RPC facade listens; passed to test runners.
    pub facade_addr: SocketAddr,
}

impl ServerContext {
    /// Assemble the shared state.
    pub async fn new(
        store: Arc<dyn Store>,
        runner: Arc<dyn Runner>,
        config: &Config,
    ) -> Result<Arc<Self>, CoreError> {
        let events = EventQueue::open(store.clone()).await?;
        Ok(Arc::new(Self {
            store,
            events,
            registry: Arc::new(ProxyRegistry::new()),
            rooms: Arc::new(RoomHub::new()),
            processes: Arc::new(ProcessTable::new()),
            runner,
            loops: TaskLoops::default(),
            task_rooms: DashMap::new(),
            data_dir: config.data_dir.clone(),
            runner_program: config.runner_program.clone(),
            facade_addr: config.facade_addr,
        }))
    }

    /// Result directory of one task.
    pub fn result_dir(&self, task_id: Uuid) -> PathBuf {
        self.data_dir.join("results").join(task_id.to_string())
    }

    /// Script root of one organization/team.
    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }

    /// Upload directory of one task resource set.
    pub fn upload_dir(&self, upload: &str) -> PathBuf {
        self.data_dir.join("uploads").join(upload)
    }
}
