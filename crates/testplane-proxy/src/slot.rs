// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proxy slots: one per connected endpoint control channel.
//!
//! A slot owns the outbound half of the control channel and a table of
//! pending calls keyed by a monotonically increasing request id. The socket
//! reader task resolves entries as responses arrive; when the socket drops,
//! every pending call resolves with a synthetic failure instead of an error
//! escaping the slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{RpcRequest, RpcResponse};

/// Errors surfaced by slot calls.
#[derive(Debug, Error, Clone)]
pub enum ProxyError {
    /// The control channel dropped while the call was pending.
    #[error("endpoint '{path}' disconnected: {reason}")]
    Disconnected {
        /// Slot key.
        path: String,
        /// Close reason.
        reason: String,
    },

    /// No response arrived within the caller's budget.
    #[error("call '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that timed out.
        method: String,
        /// Budget in milliseconds.
        timeout_ms: u64,
    },

    /// The endpoint answered with a JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// No slot is registered under the requested path.
    #[error("no proxy slot registered for '{path}'")]
    NoSlot {
        /// Requested path.
        path: String,
    },
}

type PendingCall = oneshot::Sender<Result<serde_json::Value, ProxyError>>;

/// One endpoint control-channel session.
pub struct ProxySlot {
    path: String,
    outbound: mpsc::Sender<RpcRequest>,
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ProxySlot {
    /// Create a slot and the receiver its writer task drains.
    pub fn channel(path: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<RpcRequest>) {
        let (outbound, rx) = mpsc::channel(64);
        let slot = Arc::new(Self {
            path: path.into(),
            outbound,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        (slot, rx)
    }

    /// Slot key (`uid[/backing_file]`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Forward one call across the channel and await its response.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ProxyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.disconnected("slot already closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = RpcRequest::new(id, method, params);
        if self.outbound.send(request).await.is_err() {
            self.pending.remove(&id);
            return Err(self.disconnected("writer task gone"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a verdict: the socket reader tore down.
            Ok(Err(_)) => Err(self.disconnected("connection closed")),
            Err(_) => {
                self.pending.remove(&id);
                Err(ProxyError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Resolve one pending call from a response frame.
    pub fn complete(&self, response: RpcResponse) {
        let Some((_, tx)) = self.pending.remove(&response.id) else {
            debug!(path = %self.path, id = response.id, "response for unknown request id");
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(ProxyError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };
        let _ = tx.send(outcome);
    }

    /// Wait until the slot is closed (socket drop or displacement). The
    /// session owning the socket uses this to tear down when a newer
    /// connection takes over the path.
    pub async fn closed(&self) {
        while !self.closed.load(Ordering::Acquire) {
            let notified = self.closed_notify.notified();
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
    }

    /// Resolve every pending call with a synthetic failure and refuse new
    /// ones. Called when the control channel drops.
    pub fn fail_all_pending(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            warn!(path = %self.path, pending = ids.len(), reason, "flushing pending calls");
        }
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(self.disconnected(reason)));
            }
        }
    }

    fn disconnected(&self, reason: &str) -> ProxyError {
        ProxyError::Disconnected {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Registry of live proxy slots keyed by `uid[/backing_file]`.
#[derive(Default)]
pub struct ProxyRegistry {
    slots: DashMap<String, Arc<ProxySlot>>,
}

impl ProxyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot under its path. A previous slot with the same key is
    /// displaced and returned so the caller can tear its session down.
    pub fn register(&self, slot: Arc<ProxySlot>) -> Option<Arc<ProxySlot>> {
        let displaced = self.slots.insert(slot.path().to_string(), slot);
        if let Some(ref old) = displaced {
            old.fail_all_pending("displaced by a newer connection");
        }
        displaced
    }

    /// Look up a slot.
    pub fn get(&self, path: &str) -> Option<Arc<ProxySlot>> {
        self.slots.get(path).map(|entry| entry.value().clone())
    }

    /// Remove a slot, but only if the registered one is still `slot`. A
    /// resurrected endpoint may have displaced it already.
    pub fn remove_if_current(&self, slot: &Arc<ProxySlot>) {
        self.slots
            .remove_if(slot.path(), |_, current| Arc::ptr_eq(current, slot));
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
