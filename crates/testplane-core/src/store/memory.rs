// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store backend.
//!
//! Keeps every collection in process memory behind one async mutex, with the
//! same atomicity guarantees per primitive as the PostgreSQL backend. Used
//! by the test suites and by single-node evaluation setups that do not want
//! a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{
    EndpointRecord, EndpointStatus, EventRecord, EventStatus, PRIORITY_SCAN, QueueKey,
    TaskQueueRecord, TaskRecord, TaskStatus,
};
use crate::store::Store;

#[derive(Default)]
struct EventQueueDoc {
    events: Vec<Uuid>,
    rw_lock: bool,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<Uuid, EndpointRecord>,
    tasks: HashMap<Uuid, TaskRecord>,
    queues: HashMap<QueueKey, TaskQueueRecord>,
    events: HashMap<Uuid, EventRecord>,
    event_queue: Option<EventQueueDoc>,
}

/// Store backend holding all collections in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn task_not_found(id: Uuid) -> CoreError {
    CoreError::TaskNotFound {
        task_id: id.to_string(),
    }
}

fn queue_not_found(key: &QueueKey) -> CoreError {
    CoreError::QueueNotFound {
        endpoint: key.endpoint.to_string(),
        priority: key.priority,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.endpoints.insert(endpoint.uid, endpoint.clone());
        Ok(())
    }

    async fn endpoint(&self, uid: Uuid) -> Result<Option<EndpointRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.endpoints.get(&uid).cloned())
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.endpoints.values().cloned().collect())
    }

    async fn update_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.endpoints.contains_key(&endpoint.uid) {
            return Err(CoreError::EndpointNotFound {
                uid: endpoint.uid.to_string(),
            });
        }
        inner.endpoints.insert(endpoint.uid, endpoint.clone());
        Ok(())
    }

    async fn set_endpoint_status(
        &self,
        uid: Uuid,
        status: EndpointStatus,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let endpoint = inner
            .endpoints
            .get_mut(&uid)
            .ok_or(CoreError::EndpointNotFound {
                uid: uid.to_string(),
            })?;
        endpoint.status = status;
        Ok(())
    }

    async fn set_endpoint_status_if(
        &self,
        uid: Uuid,
        expected: EndpointStatus,
        status: EndpointStatus,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        match inner.endpoints.get_mut(&uid) {
            Some(endpoint) if endpoint.status == expected => {
                endpoint.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_endpoint_last_run(
        &self,
        uid: Uuid,
        when: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let endpoint = inner
            .endpoints
            .get_mut(&uid)
            .ok_or(CoreError::EndpointNotFound {
                uid: uid.to_string(),
            })?;
        endpoint.last_run_date = Some(when);
        Ok(())
    }

    async fn delete_endpoint(&self, uid: Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.endpoints.remove(&uid);
        Ok(())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn task(&self, id: Uuid) -> Result<Option<TaskRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.status = status;
        Ok(())
    }

    async fn set_task_status_if(
        &self,
        id: Uuid,
        expected: TaskStatus,
        status: TaskStatus,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == expected => {
                task.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_task_running(
        &self,
        id: Uuid,
        endpoint: Uuid,
        run_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.status = TaskStatus::Running;
        task.endpoint_run = Some(endpoint);
        task.run_date = Some(run_date);
        Ok(())
    }

    async fn increment_kickedoff(&self, id: Uuid) -> Result<i32, CoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.kickedoff += 1;
        Ok(task.kickedoff)
    }

    async fn create_queues(&self, endpoint: &EndpointRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        for priority in PRIORITY_SCAN {
            let key = QueueKey::new(endpoint.uid, priority);
            inner.queues.entry(key).or_insert_with(|| TaskQueueRecord {
                endpoint: endpoint.uid,
                priority,
                organization: endpoint.organization.clone(),
                team: endpoint.team.clone(),
                tasks: Vec::new(),
                running_task: None,
                rw_lock: false,
                to_delete: false,
            });
        }
        Ok(())
    }

    async fn queue(&self, key: &QueueKey) -> Result<Option<TaskQueueRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.get(key).cloned())
    }

    async fn queues_for_endpoint(
        &self,
        endpoint: Uuid,
    ) -> Result<Vec<TaskQueueRecord>, CoreError> {
        let inner = self.inner.lock().await;
        let mut queues: Vec<TaskQueueRecord> = inner
            .queues
            .values()
            .filter(|q| q.endpoint == endpoint)
            .cloned()
            .collect();
        queues.sort_by_key(|q| std::cmp::Reverse(q.priority));
        Ok(queues)
    }

    async fn try_lock_queue(&self, key: &QueueKey) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        match inner.queues.get_mut(key) {
            Some(queue) if !queue.rw_lock => {
                queue.rw_lock = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(queue_not_found(key)),
        }
    }

    async fn unlock_queue(&self, key: &QueueKey) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(queue) = inner.queues.get_mut(key) {
            queue.rw_lock = false;
        }
        Ok(())
    }

    async fn pop_queue_head(&self, key: &QueueKey) -> Result<Option<Uuid>, CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner
            .queues
            .get_mut(key)
            .ok_or_else(|| queue_not_found(key))?;
        if queue.tasks.is_empty() {
            return Ok(None);
        }
        let task = queue.tasks.remove(0);
        queue.running_task = Some(task);
        Ok(Some(task))
    }

    async fn append_queue_task(&self, key: &QueueKey, task: Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner
            .queues
            .get_mut(key)
            .ok_or_else(|| queue_not_found(key))?;
        queue.tasks.push(task);
        Ok(())
    }

    async fn remove_queue_task(&self, key: &QueueKey, task: Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner
            .queues
            .get_mut(key)
            .ok_or_else(|| queue_not_found(key))?;
        queue.tasks.retain(|t| *t != task);
        Ok(())
    }

    async fn replace_queue_tasks(
        &self,
        key: &QueueKey,
        tasks: &[Uuid],
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner
            .queues
            .get_mut(key)
            .ok_or_else(|| queue_not_found(key))?;
        queue.tasks = tasks.to_vec();
        Ok(())
    }

    async fn set_running_task(
        &self,
        key: &QueueKey,
        task: Option<Uuid>,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner
            .queues
            .get_mut(key)
            .ok_or_else(|| queue_not_found(key))?;
        queue.running_task = task;
        Ok(())
    }

    async fn queue_containing_task(
        &self,
        task: Uuid,
    ) -> Result<Option<TaskQueueRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .values()
            .find(|q| q.tasks.contains(&task))
            .cloned())
    }

    async fn mark_queues_to_delete(&self, endpoint: Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        for queue in inner.queues.values_mut().filter(|q| q.endpoint == endpoint) {
            queue.to_delete = true;
        }
        Ok(())
    }

    async fn delete_queues(&self, endpoint: Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.queues.retain(|_, q| q.endpoint != endpoint);
        Ok(())
    }

    async fn reset_queue_locks(&self) -> Result<u64, CoreError> {
        let mut inner = self.inner.lock().await;
        let mut cleared = 0;
        for queue in inner.queues.values_mut() {
            if queue.rw_lock {
                queue.rw_lock = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn event(&self, id: Uuid) -> Result<Option<EventRecord>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(&id).cloned())
    }

    async fn set_event_status(&self, id: Uuid, status: EventStatus) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(&id) {
            event.status = status;
        }
        Ok(())
    }

    async fn set_event_message(
        &self,
        id: Uuid,
        message: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(&id) {
            event.message = message.clone();
        }
        Ok(())
    }

    async fn ensure_event_queue(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.event_queue.is_none() {
            inner.event_queue = Some(EventQueueDoc::default());
        }
        Ok(())
    }

    async fn try_lock_event_queue(&self) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner.event_queue.get_or_insert_with(Default::default);
        if queue.rw_lock {
            Ok(false)
        } else {
            queue.rw_lock = true;
            Ok(true)
        }
    }

    async fn unlock_event_queue(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(queue) = inner.event_queue.as_mut() {
            queue.rw_lock = false;
        }
        Ok(())
    }

    async fn pop_event_head(&self) -> Result<Option<Uuid>, CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner.event_queue.get_or_insert_with(Default::default);
        if queue.events.is_empty() {
            Ok(None)
        } else {
            Ok(Some(queue.events.remove(0)))
        }
    }

    async fn append_event(&self, event: Uuid) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner.event_queue.get_or_insert_with(Default::default);
        queue.events.push(event);
        Ok(())
    }

    async fn reset_event_queue_lock(&self) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().await;
        let queue = inner.event_queue.get_or_insert_with(Default::default);
        let was_locked = queue.rw_lock;
        queue.rw_lock = false;
        Ok(was_locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> EndpointRecord {
        EndpointRecord::new(Uuid::new_v4(), "org-1", None)
    }

    #[tokio::test]
    async fn test_queue_head_pop_moves_to_running() {
        let store = MemoryStore::new();
        let ep = endpoint();
        store.insert_endpoint(&ep).await.unwrap();
        store.create_queues(&ep).await.unwrap();

        let key = QueueKey::new(ep.uid, crate::model::Priority::Default);
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        store.append_queue_task(&key, t1).await.unwrap();
        store.append_queue_task(&key, t2).await.unwrap();

        assert_eq!(store.pop_queue_head(&key).await.unwrap(), Some(t1));
        let queue = store.queue(&key).await.unwrap().unwrap();
        assert_eq!(queue.running_task, Some(t1));
        assert_eq!(queue.tasks, vec![t2]);
    }

    #[tokio::test]
    async fn test_try_lock_is_compare_and_set() {
        let store = MemoryStore::new();
        let ep = endpoint();
        store.insert_endpoint(&ep).await.unwrap();
        store.create_queues(&ep).await.unwrap();

        let key = QueueKey::new(ep.uid, crate::model::Priority::Max);
        assert!(store.try_lock_queue(&key).await.unwrap());
        assert!(!store.try_lock_queue(&key).await.unwrap());
        store.unlock_queue(&key).await.unwrap();
        assert!(store.try_lock_queue(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_kickedoff_increment_is_monotonic() {
        let store = MemoryStore::new();
        let task = TaskRecord::new("s", "p", "org-1", None);
        store.insert_task(&task).await.unwrap();

        assert_eq!(store.increment_kickedoff(task.id).await.unwrap(), 1);
        assert_eq!(store.increment_kickedoff(task.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_guarded_status_write() {
        let store = MemoryStore::new();
        let task = TaskRecord::new("s", "p", "org-1", None);
        store.insert_task(&task).await.unwrap();

        assert!(
            store
                .set_task_status_if(task.id, TaskStatus::Waiting, TaskStatus::Cancelled)
                .await
                .unwrap()
        );
        // Terminal state is absorbing: the guard refuses a second transition.
        assert!(
            !store
                .set_task_status_if(task.id, TaskStatus::Running, TaskStatus::Successful)
                .await
                .unwrap()
        );
        let task = store.task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_create_queues_is_idempotent() {
        let store = MemoryStore::new();
        let ep = endpoint();
        store.insert_endpoint(&ep).await.unwrap();
        store.create_queues(&ep).await.unwrap();

        let key = QueueKey::new(ep.uid, crate::model::Priority::Min);
        store.append_queue_task(&key, Uuid::new_v4()).await.unwrap();
        store.create_queues(&ep).await.unwrap();

        // The populated queue survived the second create.
        assert_eq!(store.queue(&key).await.unwrap().unwrap().tasks.len(), 1);
        assert_eq!(store.queues_for_endpoint(ep.uid).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_event_queue_fifo() {
        let store = MemoryStore::new();
        store.ensure_event_queue().await.unwrap();
        let e1 = Uuid::new_v4();
        let e2 = Uuid::new_v4();
        store.append_event(e1).await.unwrap();
        store.append_event(e2).await.unwrap();
        assert_eq!(store.pop_event_head().await.unwrap(), Some(e1));
        assert_eq!(store.pop_event_head().await.unwrap(), Some(e2));
        assert_eq!(store.pop_event_head().await.unwrap(), None);
    }
}
