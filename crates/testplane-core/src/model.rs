// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed records and state machines for the control plane.
//!
//! The store keeps documents for endpoints, tasks, per-(endpoint, priority)
//! task queues and queued events. Status fields are closed state machines;
//! terminal task states are absorbing.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;

/// Queue priority. Consumers scan MAX, DEFAULT, MIN and take the first
/// non-empty queue; there is no round-robin between priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Lowest priority, may starve under sustained higher-priority load.
    Min,
    /// Default priority for tasks that do not specify one.
    Default,
    /// Highest priority.
    Max,
}

/// Scan order for queue consumers.
pub const PRIORITY_SCAN: [Priority; 3] = [Priority::Max, Priority::Default, Priority::Min];

impl Priority {
    /// Wire/storage representation.
    pub fn as_i32(self) -> i32 {
        match self {
            Priority::Min => 1,
            Priority::Default => 2,
            Priority::Max => 3,
        }
    }

    /// Parse the wire/storage representation.
    pub fn from_i32(value: i32) -> Result<Self, CoreError> {
        match value {
            1 => Ok(Priority::Min),
            2 => Ok(Priority::Default),
            3 => Ok(Priority::Max),
            _ => Err(CoreError::ValidationError {
                field: "priority".to_string(),
                message: format!("must be 1, 2 or 3, got {}", value),
            }),
        }
    }
}

/// Endpoint liveness / authorization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    /// First contact recorded, an admin has not yet allowed the endpoint.
    Unauthorized,
    /// Blacklisted; terminal until an admin action.
    Forbidden,
    /// Allowed to connect, last probe failed or none succeeded yet.
    Offline,
    /// Last RPC probe succeeded.
    Online,
}

impl EndpointStatus {
    /// Storage/wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointStatus::Unauthorized => "Unauthorized",
            EndpointStatus::Forbidden => "Forbidden",
            EndpointStatus::Offline => "Offline",
            EndpointStatus::Online => "Online",
        }
    }

    /// Parse the storage/wire representation.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "Unauthorized" => Ok(EndpointStatus::Unauthorized),
            "Forbidden" => Ok(EndpointStatus::Forbidden),
            "Offline" => Ok(EndpointStatus::Offline),
            "Online" => Ok(EndpointStatus::Online),
            other => Err(CoreError::InvalidStatus {
                entity: "endpoint",
                value: other.to_string(),
            }),
        }
    }
}

/// Task lifecycle status. `waiting -> running -> {successful|failed|cancelled}`,
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Sitting in a queue.
    Waiting,
    /// Claimed by a task loop, child process launched.
    Running,
    /// Child exited with code 0.
    Successful,
    /// Child exited non-zero without a cancellation.
    Failed,
    /// Cancelled while waiting or running.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Successful | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Storage/wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Successful => "successful",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the storage/wire representation.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "successful" => Ok(TaskStatus::Successful),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(CoreError::InvalidStatus {
                entity: "task",
                value: other.to_string(),
            }),
        }
    }
}

/// Event processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Queued, not consumed yet.
    Triggered,
    /// Consumed by the dispatcher.
    Processed,
}

impl EventStatus {
    /// Storage/wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Triggered => "Triggered",
            EventStatus::Processed => "Processed",
        }
    }

    /// Parse the storage/wire representation.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "Triggered" => Ok(EventStatus::Triggered),
            "Processed" => Ok(EventStatus::Processed),
            other => Err(CoreError::InvalidStatus {
                entity: "event",
                value: other.to_string(),
            }),
        }
    }
}

/// Closed set of event codes consumed by the dispatcher.
///
/// The numeric values are part of the storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    /// Ensure a task loop runs for the endpoint named in the message.
    StartTask,
    /// Cancel a waiting or running task.
    CancelTask,
    /// Invalidate a cached test-script parse.
    UpdateUserScript,
    /// Fetch an endpoint's configuration through the proxy hub.
    GetEndpointConfig,
}

impl EventCode {
    /// Storage representation.
    pub fn as_i32(self) -> i32 {
        match self {
            EventCode::StartTask => 200,
            EventCode::CancelTask => 201,
            EventCode::UpdateUserScript => 202,
            EventCode::GetEndpointConfig => 208,
        }
    }

    /// Parse the storage representation. Unknown codes yield `None` so the
    /// dispatcher can log and skip them.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            200 => Some(EventCode::StartTask),
            201 => Some(EventCode::CancelTask),
            202 => Some(EventCode::UpdateUserScript),
            208 => Some(EventCode::GetEndpointConfig),
            _ => None,
        }
    }
}

/// Endpoint row: a worker host identified by a server-assigned uid, stable
/// across reconnects.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    /// Server-assigned opaque identifier.
    pub uid: Uuid,
    /// Owning organization.
    pub organization: String,
    /// Optional team under the organization.
    pub team: Option<String>,
    /// Human-readable name.
    pub name: String,
    /// Liveness / authorization status.
    pub status: EndpointStatus,
    /// When a task last finished on this endpoint.
    pub last_run_date: Option<DateTime<Utc>>,
}

impl EndpointRecord {
    /// New first-contact row: Unauthorized until an admin acts.
    pub fn new(uid: Uuid, organization: impl Into<String>, team: Option<String>) -> Self {
        Self {
            uid,
            organization: organization.into(),
            team,
            name: String::new(),
            status: EndpointStatus::Unauthorized,
            last_run_date: None,
        }
    }
}

/// Task row: one requested execution of a test suite against one or more
/// endpoints.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Task identifier.
    pub id: Uuid,
    /// Test suite name.
    pub test_suite: String,
    /// Path of the test script, relative to the script root.
    pub test_path: String,
    /// Test cases to run; empty means the whole suite.
    pub testcases: Vec<String>,
    /// Inherited from the test, immutable.
    pub organization: String,
    /// Inherited from the test, immutable.
    pub team: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Claim counter, incremented atomically on first worker claim.
    pub kickedoff: i32,
    /// Fan-out set of endpoint uids.
    pub endpoint_list: Vec<Uuid>,
    /// Whether the task may run on several endpoints at once.
    pub parallelization: bool,
    /// The endpoint that actually ran the task.
    pub endpoint_run: Option<Uuid>,
    /// Queue priority.
    pub priority: Priority,
    /// Variables materialized for the test runner.
    pub variables: serde_json::Value,
    /// Upload-directory identifier for task resources.
    pub upload_dir: Option<String>,
    /// When the task was created.
    pub schedule_date: DateTime<Utc>,
    /// When a worker claimed the task.
    pub run_date: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// New waiting task with defaults.
    pub fn new(
        test_suite: impl Into<String>,
        test_path: impl Into<String>,
        organization: impl Into<String>,
        team: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_suite: test_suite.into(),
            test_path: test_path.into(),
            testcases: Vec::new(),
            organization: organization.into(),
            team,
            status: TaskStatus::Waiting,
            kickedoff: 0,
            endpoint_list: Vec::new(),
            parallelization: false,
            endpoint_run: None,
            priority: Priority::Default,
            variables: serde_json::Value::Object(Default::default()),
            upload_dir: None,
            schedule_date: Utc::now(),
            run_date: None,
        }
    }
}

/// Key of a task queue: the (endpoint, priority) pair is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    /// Owning endpoint uid.
    pub endpoint: Uuid,
    /// Queue priority.
    pub priority: Priority,
}

impl QueueKey {
    /// Build a key.
    pub fn new(endpoint: Uuid, priority: Priority) -> Self {
        Self { endpoint, priority }
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.priority.as_i32())
    }
}

/// Task queue row.
///
/// Invariant: a task appears in at most one queue; `running_task` is either
/// unset or references a task no longer present in `tasks`.
#[derive(Debug, Clone)]
pub struct TaskQueueRecord {
    /// Owning endpoint uid.
    pub endpoint: Uuid,
    /// Queue priority.
    pub priority: Priority,
    /// Owning organization.
    pub organization: String,
    /// Optional team.
    pub team: Option<String>,
    /// Waiting tasks, FIFO.
    pub tasks: Vec<Uuid>,
    /// The task currently claimed from this queue, if any.
    pub running_task: Option<Uuid>,
    /// Optimistic write lock, compare-and-set through the store.
    pub rw_lock: bool,
    /// Deletion tombstone observed by the task loop.
    pub to_delete: bool,
}

impl TaskQueueRecord {
    /// Key of this queue.
    pub fn key(&self) -> QueueKey {
        QueueKey::new(self.endpoint, self.priority)
    }
}

/// Queued mutation request consumed by the single event dispatcher.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Event identifier.
    pub id: Uuid,
    /// Typed code; `None` when the stored code is outside the closed set.
    pub code: Option<EventCode>,
    /// Free-form payload.
    pub message: serde_json::Value,
    /// Owning organization.
    pub organization: String,
    /// Optional team.
    pub team: Option<String>,
    /// Processing status.
    pub status: EventStatus,
    /// When the event was posted.
    pub date: DateTime<Utc>,
}

impl EventRecord {
    /// New triggered event.
    pub fn new(
        code: EventCode,
        message: serde_json::Value,
        organization: impl Into<String>,
        team: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: Some(code),
            message,
            organization: organization.into(),
            team,
            status: EventStatus::Triggered,
            date: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_roundtrip() {
        for p in [Priority::Min, Priority::Default, Priority::Max] {
            assert_eq!(Priority::from_i32(p.as_i32()).unwrap(), p);
        }
        assert!(Priority::from_i32(0).is_err());
        assert!(Priority::from_i32(4).is_err());
    }

    #[test]
    fn test_priority_scan_order() {
        assert_eq!(
            PRIORITY_SCAN,
            [Priority::Max, Priority::Default, Priority::Min]
        );
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Waiting.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Successful.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [
            TaskStatus::Waiting,
            TaskStatus::Running,
            TaskStatus::Successful,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()).unwrap(), s);
        }
        for s in [
            EndpointStatus::Unauthorized,
            EndpointStatus::Forbidden,
            EndpointStatus::Offline,
            EndpointStatus::Online,
        ] {
            assert_eq!(EndpointStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(TaskStatus::parse("done").is_err());
        assert!(EndpointStatus::parse("online").is_err());
    }

    #[test]
    fn test_event_code_values() {
        assert_eq!(EventCode::StartTask.as_i32(), 200);
        assert_eq!(EventCode::CancelTask.as_i32(), 201);
        assert_eq!(EventCode::UpdateUserScript.as_i32(), 202);
        assert_eq!(EventCode::GetEndpointConfig.as_i32(), 208);
        assert_eq!(EventCode::from_i32(205), None);
    }

    #[test]
    fn test_new_task_defaults() {
        let task = TaskRecord::new("smoke", "suites/smoke", "org-1", None);
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.kickedoff, 0);
        assert_eq!(task.priority, Priority::Default);
        assert!(!task.parallelization);
        assert!(task.endpoint_run.is_none());
    }

    #[test]
    fn test_queue_key_display() {
        let uid = Uuid::new_v4();
        let key = QueueKey::new(uid, Priority::Max);
        assert_eq!(key.to_string(), format!("{}:3", uid));
    }
}
