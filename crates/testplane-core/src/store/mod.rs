// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store interface and backends.
//!
//! Every mutation the queues and state machines rely on is a single atomic
//! primitive here: compare-and-set for locks and guarded status writes,
//! find-and-modify for counters, head-pop and list-append for the queues.
//! Callers never observe partial state.

/// In-memory backend (tests, single-node evaluation).
pub mod memory;

/// PostgreSQL backend.
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{
    EndpointRecord, EndpointStatus, EventRecord, EventStatus, QueueKey, TaskQueueRecord,
    TaskRecord, TaskStatus,
};

/// Persistence interface used by the queues, the dispatcher and the loops.
#[allow(missing_docs)]
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    async fn insert_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), CoreError>;

    async fn endpoint(&self, uid: Uuid) -> Result<Option<EndpointRecord>, CoreError>;

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>, CoreError>;

    /// Rewrite name/status/team of an existing endpoint row (admin actions).
    async fn update_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), CoreError>;

    async fn set_endpoint_status(
        &self,
        uid: Uuid,
        status: EndpointStatus,
    ) -> Result<(), CoreError>;

    /// Guarded status transition; returns whether the write took place.
    async fn set_endpoint_status_if(
        &self,
        uid: Uuid,
        expected: EndpointStatus,
        status: EndpointStatus,
    ) -> Result<bool, CoreError>;

    async fn set_endpoint_last_run(
        &self,
        uid: Uuid,
        when: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn delete_endpoint(&self, uid: Uuid) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError>;

    async fn task(&self, id: Uuid) -> Result<Option<TaskRecord>, CoreError>;

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), CoreError>;

    /// Guarded status transition; returns whether the write took place.
    /// This is what keeps terminal states absorbing under races.
    async fn set_task_status_if(
        &self,
        id: Uuid,
        expected: TaskStatus,
        status: TaskStatus,
    ) -> Result<bool, CoreError>;

    /// Move a claimed task to running and stamp the endpoint and run date.
    async fn mark_task_running(
        &self,
        id: Uuid,
        endpoint: Uuid,
        run_date: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Atomically increment `kickedoff`, returning the post-increment value.
    async fn increment_kickedoff(&self, id: Uuid) -> Result<i32, CoreError>;

    // ------------------------------------------------------------------
    // Task queues
    // ------------------------------------------------------------------

    /// Create the three priority queues of an endpoint atomically.
    /// Existing queues are left untouched.
    async fn create_queues(&self, endpoint: &EndpointRecord) -> Result<(), CoreError>;

    async fn queue(&self, key: &QueueKey) -> Result<Option<TaskQueueRecord>, CoreError>;

    async fn queues_for_endpoint(
        &self,
        endpoint: Uuid,
    ) -> Result<Vec<TaskQueueRecord>, CoreError>;

    /// Compare-and-set `rw_lock` false -> true. One attempt, no retries.
    async fn try_lock_queue(&self, key: &QueueKey) -> Result<bool, CoreError>;

    /// Unconditionally clear `rw_lock`.
    async fn unlock_queue(&self, key: &QueueKey) -> Result<(), CoreError>;

    /// Atomically remove the queue head and assign it to `running_task`.
    /// Returns the claimed task id, or `None` when the queue is empty.
    async fn pop_queue_head(&self, key: &QueueKey) -> Result<Option<Uuid>, CoreError>;

    /// Atomic append; does not take the queue lock.
    async fn append_queue_task(&self, key: &QueueKey, task: Uuid) -> Result<(), CoreError>;

    /// Remove one waiting task from the list (cancellation of a waiting task).
    async fn remove_queue_task(&self, key: &QueueKey, task: Uuid) -> Result<(), CoreError>;

    /// Replace the whole task list (flush/reorder under the queue lock).
    async fn replace_queue_tasks(
        &self,
        key: &QueueKey,
        tasks: &[Uuid],
    ) -> Result<(), CoreError>;

    async fn set_running_task(
        &self,
        key: &QueueKey,
        task: Option<Uuid>,
    ) -> Result<(), CoreError>;

    /// Find the queue whose waiting list contains the task, if any.
    async fn queue_containing_task(
        &self,
        task: Uuid,
    ) -> Result<Option<TaskQueueRecord>, CoreError>;

    /// Set the deletion tombstone on all queues of an endpoint.
    async fn mark_queues_to_delete(&self, endpoint: Uuid) -> Result<(), CoreError>;

    async fn delete_queues(&self, endpoint: Uuid) -> Result<(), CoreError>;

    /// Clear stale `rw_lock` flags (service restart). Returns how many were
    /// cleared.
    async fn reset_queue_locks(&self) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Events and the singleton event queue
    // ------------------------------------------------------------------

    async fn insert_event(&self, event: &EventRecord) -> Result<(), CoreError>;

    async fn event(&self, id: Uuid) -> Result<Option<EventRecord>, CoreError>;

    async fn set_event_status(&self, id: Uuid, status: EventStatus) -> Result<(), CoreError>;

    /// Rewrite the event message (used to attach handler errors).
    async fn set_event_message(
        &self,
        id: Uuid,
        message: &serde_json::Value,
    ) -> Result<(), CoreError>;

    /// Create the singleton event queue row if it does not exist.
    async fn ensure_event_queue(&self) -> Result<(), CoreError>;

    async fn try_lock_event_queue(&self) -> Result<bool, CoreError>;

    async fn unlock_event_queue(&self) -> Result<(), CoreError>;

    /// Atomically remove the event queue head.
    async fn pop_event_head(&self) -> Result<Option<Uuid>, CoreError>;

    /// Atomic append; does not take the queue lock.
    async fn append_event(&self, event: Uuid) -> Result<(), CoreError>;

    /// Clear a stale event queue lock (service restart). Returns whether a
    /// lock was cleared.
    async fn reset_event_queue_lock(&self) -> Result<bool, CoreError>;
}
