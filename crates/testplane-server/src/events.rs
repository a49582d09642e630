// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event dispatcher.
//!
//! A single loop consumes the process-wide event queue in FIFO order and
//! invokes the handler matching each code. Events are the one serialization
//! point for queue mutations that are not local to a per-endpoint loop:
//! task-loop creation, wake-ups and cancellations all pass through here, so
//! none of them can race each other.
//!
//! A handler error never stops the loop: it is logged, recorded into the
//! event's message under `"error"`, and the dispatcher moves on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use testplane_core::{
    CoreError, EventCode, EventRecord, EventStatus, Priority, QueueKey, TaskStatus,
};
use testplane_proxy::proxy_path;

use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::task_loop::ensure_task_loop;

/// Idle sleep between polls of an empty event queue.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded spin of the cancel-vs-claim race: attempts x interval.
const CANCEL_SPIN_ATTEMPTS: u32 = 20;
/// Pause between cancel-race status reads.
const CANCEL_SPIN_INTERVAL: Duration = Duration::from_millis(100);

/// Budget for the GET_ENDPOINT_CONFIG forward call.
const CONFIG_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Post an event: persist the row, then append it to the queue.
pub async fn push_event(
    ctx: &ServerContext,
    organization: &str,
    team: Option<String>,
    code: EventCode,
    message: serde_json::Value,
) -> std::result::Result<Uuid, CoreError> {
    let event = EventRecord::new(code, message, organization, team);
    ctx.store.insert_event(&event).await?;
    ctx.events.push(event.id).await?;
    debug!(event_id = %event.id, code = code.as_i32(), "event queued");
    Ok(event.id)
}

/// The single event-consuming loop.
pub struct EventDispatcher {
    ctx: Arc<ServerContext>,
    shutdown: Arc<Notify>,
}

impl EventDispatcher {
    /// Bind a dispatcher to the shared state.
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown. Clears a stale event-queue lock first (service
    /// restart), then polls.
    pub async fn run(&self) {
        if let Ok(true) = self.ctx.events.reset_lock().await {
            info!("reset a stale event queue lock");
        }
        info!("event loop started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("event loop received shutdown signal");
                    break;
                }

                event = self.ctx.events.pop() => {
                    match event {
                        Ok(Some(event)) => self.process(event).await,
                        Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                        Err(e) => {
                            warn!(error = %e, "polling event queue failed");
                            tokio::time::sleep(POLL_INTERVAL).await;
                        }
                    }
                }
            }
        }

        info!("event loop stopped");
    }

    /// Dispatch one event to its handler and mark it processed.
    pub async fn process(&self, event: EventRecord) {
        let Some(code) = event.code else {
            // Outside the closed code set: skip, leave surrounding events alone.
            error!(event_id = %event.id, "unknown event code, skipping");
            return;
        };
        info!(event_id = %event.id, code = code.as_i32(), "processing event");

        let outcome = match code {
            EventCode::StartTask => handle_start_task(&self.ctx, &event).await,
            EventCode::CancelTask => handle_cancel_task(&self.ctx, &event).await,
            EventCode::UpdateUserScript => handle_update_user_script(&self.ctx, &event).await,
            EventCode::GetEndpointConfig => handle_get_endpoint_config(&self.ctx, &event).await,
        };

        if let Err(e) = outcome {
            error!(event_id = %event.id, code = code.as_i32(), error = %e, "event handler failed");
            let mut message = event.message.clone();
            if let Some(map) = message.as_object_mut() {
                map.insert(
                    "error".to_string(),
                    serde_json::Value::String(e.to_string()),
                );
            }
            if let Err(e) = self.ctx.store.set_event_message(event.id, &message).await {
                warn!(event_id = %event.id, error = %e, "failed to record handler error");
            }
        }
        if let Err(e) = self
            .ctx
            .store
            .set_event_status(event.id, EventStatus::Processed)
            .await
        {
            warn!(event_id = %event.id, error = %e, "failed to mark event processed");
        }
    }
}

fn message_uuid(event: &EventRecord, field: &str) -> Option<Uuid> {
    event
        .message
        .get(field)
        .and_then(|value| value.as_str())
        .and_then(|value| Uuid::parse_str(value).ok())
}

/// START_TASK: make sure a task loop is draining the endpoint's queues.
async fn handle_start_task(ctx: &Arc<ServerContext>, event: &EventRecord) -> Result<()> {
    let to_delete = event
        .message
        .get("to_delete")
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    let Some(uid) = message_uuid(event, "endpoint_uid") else {
        error!(event_id = %event.id, "START_TASK without a valid endpoint_uid");
        return Ok(());
    };
    let Some(endpoint) = ctx.store.endpoint(uid).await? else {
        if !to_delete {
            error!(endpoint = %uid, "endpoint not found for START_TASK");
        }
        return Ok(());
    };
    ensure_task_loop(ctx, endpoint).await;
    Ok(())
}

/// CANCEL_TASK: remove a waiting task from its queue, or terminate the
/// child of a running one. Tolerant of every race with completion; state
/// mismatches log and succeed.
async fn handle_cancel_task(ctx: &Arc<ServerContext>, event: &EventRecord) -> Result<()> {
    let Some(task_id) = message_uuid(event, "task_id") else {
        error!(event_id = %event.id, "CANCEL_TASK without a valid task_id");
        return Ok(());
    };
    let Some(task) = ctx.store.task(task_id).await? else {
        error!(task_id = %task_id, "task not found for CANCEL_TASK");
        return Ok(());
    };

    let endpoint_uid = event
        .message
        .get("endpoint_uid")
        .and_then(|value| value.as_str())
        .unwrap_or("");

    if endpoint_uid.is_empty() {
        // No endpoint named: the task is waiting in some queue, drop it there.
        let Some(queue) = ctx.store.queue_containing_task(task_id).await? else {
            warn!(task_id = %task_id, "no queue holds the task, nothing to cancel");
            return Ok(());
        };
        ctx.store.remove_queue_task(&queue.key(), task_id).await?;
        ctx.store
            .set_task_status_if(task_id, TaskStatus::Waiting, TaskStatus::Cancelled)
            .await?;
        info!(task_id = %task_id, "waiting task cancelled");
        return Ok(());
    }

    let Ok(endpoint) = Uuid::parse_str(endpoint_uid) else {
        error!(endpoint = %endpoint_uid, "CANCEL_TASK with a malformed endpoint_uid");
        return Ok(());
    };
    let priority = event
        .message
        .get("priority")
        .and_then(|value| value.as_i64())
        .and_then(|value| Priority::from_i32(value as i32).ok())
        .unwrap_or(task.priority);
    let key = QueueKey::new(endpoint, priority);
    let Some(queue) = ctx.store.queue(&key).await? else {
        error!(queue = %key, "task queue not found for CANCEL_TASK");
        return Ok(());
    };

    let mut status = task.status;
    if status == TaskStatus::Waiting {
        if queue.running_task == Some(task_id) && ctx.loops.is_running(endpoint).await {
            // Claimed but not yet running: give the loop a bounded window to
            // move it, then cancel regardless.
            let mut became_running = false;
            for _ in 0..CANCEL_SPIN_ATTEMPTS {
                if let Some(current) = ctx.store.task(task_id).await?
                    && current.status == TaskStatus::Running
                {
                    became_running = true;
                    break;
                }
                tokio::time::sleep(CANCEL_SPIN_INTERVAL).await;
            }
            if !became_running {
                warn!(task_id = %task_id, "claimed task never started running, cancelling anyway");
                ctx.store.set_running_task(&key, None).await?;
                ctx.store
                    .set_task_status_if(task_id, TaskStatus::Waiting, TaskStatus::Cancelled)
                    .await?;
                return Ok(());
            }
            status = TaskStatus::Running;
        } else {
            ctx.store.remove_queue_task(&key, task_id).await?;
            ctx.store
                .set_task_status_if(task_id, TaskStatus::Waiting, TaskStatus::Cancelled)
                .await?;
            info!(task_id = %task_id, "waiting task cancelled without a child process");
            return Ok(());
        }
    }

    if status == TaskStatus::Running {
        if ctx.loops.is_running(endpoint).await && ctx.processes.terminate(task_id) {
            // The loop observes the non-zero exit but the status below wins.
            ctx.store
                .set_task_status_if(task_id, TaskStatus::Running, TaskStatus::Cancelled)
                .await?;
            ctx.store.set_running_task(&key, None).await?;
            info!(task_id = %task_id, "running task cancelled, child terminated");
            return Ok(());
        }
        error!(task_id = %task_id, "no child process found while cancelling a running task");
        ctx.store
            .set_task_status_if(task_id, TaskStatus::Running, TaskStatus::Cancelled)
            .await?;
        ctx.store.set_running_task(&key, None).await?;
        info!(task_id = %task_id, "running task cancelled without a child process");
    } else if status.is_terminal() {
        // Redelivery or racing completion; nothing left to do.
        info!(task_id = %task_id, status = status.as_str(), "cancel on a settled task, ignoring");
    }
    Ok(())
}

/// UPDATE_USER_SCRIPT: script parsing lives outside the core; there is no
/// parse cache to drop here, the event only marks the path dirty.
async fn handle_update_user_script(_ctx: &Arc<ServerContext>, event: &EventRecord) -> Result<()> {
    let script = event
        .message
        .get("script")
        .and_then(|value| value.as_str())
        .unwrap_or("");
    debug!(script, "user script updated");
    Ok(())
}

/// GET_ENDPOINT_CONFIG: forward through the proxy hub and record the reply
/// on the event for admin inspection.
async fn handle_get_endpoint_config(ctx: &Arc<ServerContext>, event: &EventRecord) -> Result<()> {
    let Some(uid) = message_uuid(event, "endpoint_uid") else {
        error!(event_id = %event.id, "GET_ENDPOINT_CONFIG without a valid endpoint_uid");
        return Ok(());
    };
    let path = proxy_path(&uid.to_string(), "");
    let Some(slot) = ctx.registry.get(&path) else {
        return Err(Error::Other(format!(
            "endpoint '{}' has no active control channel",
            uid
        )));
    };
    let config = slot
        .call(
            "get_endpoint_config",
            serde_json::json!([]),
            CONFIG_CALL_TIMEOUT,
        )
        .await?;

    let mut message = event.message.clone();
    if let Some(map) = message.as_object_mut() {
        map.insert("config".to_string(), config);
    }
    ctx.store.set_event_message(event.id, &message).await?;
    Ok(())
}
