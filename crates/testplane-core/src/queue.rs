// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed queue primitives over the store.
//!
//! `TaskQueue` and `EventQueue` wrap the store's atomic operations with the
//! optimistic lock discipline: `rw_lock` is acquired by compare-and-set,
//! retried every 100 ms for up to 5 s. `pop` holds the lock for the duration
//! of the head removal; `push` is a lone atomic append and does not take it.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{EventRecord, QueueKey, TaskRecord, TaskStatus};
use crate::store::Store;

/// Lock acquisition attempts before surrendering.
pub const LOCK_ATTEMPTS: u32 = 50;
/// Pause between lock acquisition attempts.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Handle on one per-(endpoint, priority) task queue.
pub struct TaskQueue {
    store: Arc<dyn Store>,
    key: QueueKey,
}

impl TaskQueue {
    /// Bind a handle to a queue document.
    pub fn new(store: Arc<dyn Store>, key: QueueKey) -> Self {
        Self { store, key }
    }

    /// The queue this handle points at.
    pub fn key(&self) -> QueueKey {
        self.key
    }

    /// Try to take `rw_lock` within the retry budget.
    pub async fn acquire_lock(&self) -> Result<bool, CoreError> {
        self.acquire_lock_with(LOCK_ATTEMPTS).await
    }

    async fn acquire_lock_with(&self, attempts: u32) -> Result<bool, CoreError> {
        for _ in 0..attempts {
            if self.store.try_lock_queue(&self.key).await? {
                return Ok(true);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
        Ok(false)
    }

    /// Unconditionally clear `rw_lock`.
    pub async fn release_lock(&self) -> Result<(), CoreError> {
        self.store.unlock_queue(&self.key).await
    }

    /// Claim the queue head: the task moves from `tasks` to `running_task`
    /// atomically. Returns `None` when the queue is empty or busy; a busy
    /// queue is retried by the caller's next cycle.
    pub async fn pop(&self) -> Result<Option<TaskRecord>, CoreError> {
        if !self.acquire_lock().await? {
            warn!(queue = %self.key, "queue busy, pop surrendered");
            return Ok(None);
        }
        let popped = self.store.pop_queue_head(&self.key).await;
        self.release_lock().await?;

        let Some(task_id) = popped? else {
            return Ok(None);
        };
        match self.store.task(task_id).await? {
            Some(task) => Ok(Some(task)),
            None => {
                // The referenced task row is gone; drop the claim.
                warn!(queue = %self.key, task_id = %task_id, "popped a deleted task, ignoring");
                self.store.set_running_task(&self.key, None).await?;
                Ok(None)
            }
        }
    }

    /// Atomic append. Does not take the queue lock.
    pub async fn push(&self, task: Uuid) -> Result<(), CoreError> {
        self.store.append_queue_task(&self.key, task).await
    }

    /// Empty the queue under the lock. With `cancelled`, every still-waiting
    /// task is marked cancelled first.
    pub async fn flush(&self, cancelled: bool) -> Result<(), CoreError> {
        if !self.acquire_lock().await? {
            return Err(CoreError::LockTimeout {
                queue: self.key.to_string(),
            });
        }
        let result = self.flush_locked(cancelled).await;
        self.release_lock().await?;
        result
    }

    async fn flush_locked(&self, cancelled: bool) -> Result<(), CoreError> {
        let Some(queue) = self.store.queue(&self.key).await? else {
            return Err(CoreError::QueueNotFound {
                endpoint: self.key.endpoint.to_string(),
                priority: self.key.priority,
            });
        };
        if cancelled {
            for task in &queue.tasks {
                self.store
                    .set_task_status_if(*task, TaskStatus::Waiting, TaskStatus::Cancelled)
                    .await?;
            }
        }
        self.store.replace_queue_tasks(&self.key, &[]).await
    }
}

/// Handle on the process-wide event queue.
pub struct EventQueue {
    store: Arc<dyn Store>,
}

impl EventQueue {
    /// Bind a handle to the singleton event queue, creating it if needed.
    pub async fn open(store: Arc<dyn Store>) -> Result<Self, CoreError> {
        store.ensure_event_queue().await?;
        Ok(Self { store })
    }

    async fn acquire_lock(&self) -> Result<bool, CoreError> {
        for _ in 0..LOCK_ATTEMPTS {
            if self.store.try_lock_event_queue().await? {
                return Ok(true);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
        Ok(false)
    }

    /// Take the oldest queued event, FIFO.
    pub async fn pop(&self) -> Result<Option<EventRecord>, CoreError> {
        if !self.acquire_lock().await? {
            warn!("event queue busy, pop surrendered");
            return Ok(None);
        }
        let popped = self.store.pop_event_head().await;
        self.store.unlock_event_queue().await?;

        let Some(event_id) = popped? else {
            return Ok(None);
        };
        match self.store.event(event_id).await? {
            Some(event) => Ok(Some(event)),
            None => {
                warn!(event_id = %event_id, "popped a deleted event, ignoring");
                Ok(None)
            }
        }
    }

    /// Atomic append. Does not take the queue lock.
    pub async fn push(&self, event: Uuid) -> Result<(), CoreError> {
        self.store.append_event(event).await
    }

    /// Clear a stale lock left by a previous process.
    pub async fn reset_lock(&self) -> Result<bool, CoreError> {
        self.store.reset_event_queue_lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointRecord, EventCode, Priority};
    use crate::store::MemoryStore;

    async fn queue_fixture() -> (Arc<dyn Store>, TaskQueue) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let endpoint = EndpointRecord::new(Uuid::new_v4(), "org-1", None);
        store.insert_endpoint(&endpoint).await.unwrap();
        store.create_queues(&endpoint).await.unwrap();
        let key = QueueKey::new(endpoint.uid, Priority::Default);
        let queue = TaskQueue::new(store.clone(), key);
        (store, queue)
    }

    async fn insert_task(store: &Arc<dyn Store>) -> TaskRecord {
        let task = TaskRecord::new("suite", "path", "org-1", None);
        store.insert_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_push_pop_fifo_law() {
        let (store, queue) = queue_fixture().await;
        queue.flush(false).await.unwrap();

        let t1 = insert_task(&store).await;
        let t2 = insert_task(&store).await;
        let t3 = insert_task(&store).await;
        for t in [&t1, &t2, &t3] {
            queue.push(t.id).await.unwrap();
        }

        assert_eq!(queue.pop().await.unwrap().unwrap().id, t1.id);
        assert_eq!(queue.pop().await.unwrap().unwrap().id, t2.id);
        assert_eq!(queue.pop().await.unwrap().unwrap().id, t3.id);
        assert!(queue.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_assigns_running_task() {
        let (store, queue) = queue_fixture().await;
        let task = insert_task(&store).await;
        queue.push(task.id).await.unwrap();

        let popped = queue.pop().await.unwrap().unwrap();
        assert_eq!(popped.id, task.id);

        let record = store.queue(&queue.key()).await.unwrap().unwrap();
        assert_eq!(record.running_task, Some(task.id));
        assert!(record.tasks.is_empty());
        assert!(!record.rw_lock, "pop must release the lock");
    }

    #[tokio::test]
    async fn test_pop_surrenders_when_locked() {
        let (store, queue) = queue_fixture().await;
        let task = insert_task(&store).await;
        queue.push(task.id).await.unwrap();

        assert!(store.try_lock_queue(&queue.key()).await.unwrap());
        // Short retry budget so the test does not sit out the full 5 s.
        assert!(!queue.acquire_lock_with(2).await.unwrap());
        store.unlock_queue(&queue.key()).await.unwrap();
        assert!(queue.acquire_lock_with(2).await.unwrap());
        queue.release_lock().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_cancels_waiting_tasks() {
        let (store, queue) = queue_fixture().await;
        let t1 = insert_task(&store).await;
        let t2 = insert_task(&store).await;
        queue.push(t1.id).await.unwrap();
        queue.push(t2.id).await.unwrap();

        queue.flush(true).await.unwrap();

        for id in [t1.id, t2.id] {
            let task = store.task(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
        }
        let record = store.queue(&queue.key()).await.unwrap().unwrap();
        assert!(record.tasks.is_empty());
        assert!(queue.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_without_cancel_keeps_statuses() {
        let (store, queue) = queue_fixture().await;
        let task = insert_task(&store).await;
        queue.push(task.id).await.unwrap();

        queue.flush(false).await.unwrap();

        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_event_queue_fifo_and_missing_event() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue = EventQueue::open(store.clone()).await.unwrap();

        let event = EventRecord::new(
            EventCode::StartTask,
            serde_json::json!({"endpoint_uid": "x"}),
            "org-1",
            None,
        );
        store.insert_event(&event).await.unwrap();
        queue.push(event.id).await.unwrap();
        // A dangling reference is skipped, not an error.
        queue.push(Uuid::new_v4()).await.unwrap();

        let popped = queue.pop().await.unwrap().unwrap();
        assert_eq!(popped.id, event.id);
        assert!(queue.pop().await.unwrap().is_none());
        assert!(queue.pop().await.unwrap().is_none());
    }
}
