// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store backend.
//!
//! Queue task lists live in jsonb columns so that every queue primitive is a
//! single UPDATE statement and therefore atomic without explicit
//! transactions. The pervasive primitives (lock compare-and-set, head pop,
//! counter increment, guarded status writes) retry transient connection
//! errors a small fixed number of times before surfacing them.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{
    EndpointRecord, EndpointStatus, EventCode, EventRecord, EventStatus, Priority, QueueKey,
    TaskQueueRecord, TaskRecord, TaskStatus,
};
use crate::store::Store;

const TRANSIENT_RETRIES: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// Store backend over a PostgreSQL pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create all tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), CoreError> {
        sqlx::raw_sql(include_str!("../../migrations/schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

async fn with_retries<T, Fut>(
    operation: &'static str,
    mut attempt_fn: impl FnMut() -> Fut,
) -> Result<T, CoreError>
where
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < TRANSIENT_RETRIES => {
                attempt += 1;
                warn!(operation, attempt, error = %err, "transient store error, retrying");
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
            }
            Err(err) => {
                return Err(CoreError::DatabaseError {
                    operation: operation.to_string(),
                    details: err.to_string(),
                });
            }
        }
    }
}

fn uuid_list_to_json(ids: &[Uuid]) -> serde_json::Value {
    serde_json::Value::Array(
        ids.iter()
            .map(|id| serde_json::Value::String(id.to_string()))
            .collect(),
    )
}

fn uuid_list_from_json(value: &serde_json::Value) -> Result<Vec<Uuid>, CoreError> {
    let items = value.as_array().cloned().unwrap_or_default();
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| CoreError::DatabaseError {
                    operation: "decode".to_string(),
                    details: format!("not a uuid list element: {}", item),
                })
        })
        .collect()
}

fn string_list_from_json(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

type EndpointRow = (
    Uuid,
    String,
    Option<String>,
    String,
    String,
    Option<DateTime<Utc>>,
);

fn endpoint_from_row(row: EndpointRow) -> Result<EndpointRecord, CoreError> {
    let (uid, organization, team, name, status, last_run_date) = row;
    Ok(EndpointRecord {
        uid,
        organization,
        team,
        name,
        status: EndpointStatus::parse(&status)?,
        last_run_date,
    })
}

const ENDPOINT_COLUMNS: &str = "uid, organization, team, name, status, last_run_date";

type TaskRow = (
    Uuid,
    String,
    String,
    serde_json::Value,
    String,
    Option<String>,
    String,
    i32,
    serde_json::Value,
    bool,
    Option<Uuid>,
    i32,
    serde_json::Value,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

fn task_from_row(row: TaskRow) -> Result<TaskRecord, CoreError> {
    let (
        id,
        test_suite,
        test_path,
        testcases,
        organization,
        team,
        status,
        kickedoff,
        endpoint_list,
        parallelization,
        endpoint_run,
        priority,
        variables,
        upload_dir,
        schedule_date,
        run_date,
    ) = row;
    Ok(TaskRecord {
        id,
        test_suite,
        test_path,
        testcases: string_list_from_json(&testcases),
        organization,
        team,
        status: TaskStatus::parse(&status)?,
        kickedoff,
        endpoint_list: uuid_list_from_json(&endpoint_list)?,
        parallelization,
        endpoint_run,
        priority: Priority::from_i32(priority)?,
        variables,
        upload_dir,
        schedule_date,
        run_date,
    })
}

const TASK_COLUMNS: &str = "id, test_suite, test_path, testcases, organization, team, status, \
     kickedoff, endpoint_list, parallelization, endpoint_run, priority, variables, upload_dir, \
     schedule_date, run_date";

type QueueRow = (
    Uuid,
    i32,
    String,
    Option<String>,
    serde_json::Value,
    Option<Uuid>,
    bool,
    bool,
);

fn queue_from_row(row: QueueRow) -> Result<TaskQueueRecord, CoreError> {
    let (endpoint, priority, organization, team, tasks, running_task, rw_lock, to_delete) = row;
    Ok(TaskQueueRecord {
        endpoint,
        priority: Priority::from_i32(priority)?,
        organization,
        team,
        tasks: uuid_list_from_json(&tasks)?,
        running_task,
        rw_lock,
        to_delete,
    })
}

const QUEUE_COLUMNS: &str =
    "endpoint_uid, priority, organization, team, tasks, running_task, rw_lock, to_delete";

type EventRow = (
    Uuid,
    i32,
    serde_json::Value,
    String,
    Option<String>,
    String,
    DateTime<Utc>,
);

fn event_from_row(row: EventRow) -> Result<EventRecord, CoreError> {
    let (id, code, message, organization, team, status, date) = row;
    Ok(EventRecord {
        id,
        code: EventCode::from_i32(code),
        message,
        organization,
        team,
        status: EventStatus::parse(&status)?,
        date,
    })
}

const EVENT_COLUMNS: &str = "id, code, message, organization, team, status, date";

#[async_trait]
impl Store for PostgresStore {
    async fn insert_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO endpoints (uid, organization, team, name, status, last_run_date) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (uid) DO UPDATE \
             SET organization = $2, team = $3, name = $4, status = $5",
        )
        .bind(endpoint.uid)
        .bind(&endpoint.organization)
        .bind(&endpoint.team)
        .bind(&endpoint.name)
        .bind(endpoint.status.as_str())
        .bind(endpoint.last_run_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn endpoint(&self, uid: Uuid) -> Result<Option<EndpointRecord>, CoreError> {
        let row: Option<EndpointRow> = sqlx::query_as(&format!(
            "SELECT {} FROM endpoints WHERE uid = $1",
            ENDPOINT_COLUMNS
        ))
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(endpoint_from_row).transpose()
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointRecord>, CoreError> {
        let rows: Vec<EndpointRow> = sqlx::query_as(&format!(
            "SELECT {} FROM endpoints ORDER BY organization, name",
            ENDPOINT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(endpoint_from_row).collect()
    }

    async fn update_endpoint(&self, endpoint: &EndpointRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE endpoints SET organization = $2, team = $3, name = $4, status = $5 \
             WHERE uid = $1",
        )
        .bind(endpoint.uid)
        .bind(&endpoint.organization)
        .bind(&endpoint.team)
        .bind(&endpoint.name)
        .bind(endpoint.status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::EndpointNotFound {
                uid: endpoint.uid.to_string(),
            });
        }
        Ok(())
    }

    async fn set_endpoint_status(
        &self,
        uid: Uuid,
        status: EndpointStatus,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE endpoints SET status = $2 WHERE uid = $1")
            .bind(uid)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::EndpointNotFound {
                uid: uid.to_string(),
            });
        }
        Ok(())
    }

    async fn set_endpoint_status_if(
        &self,
        uid: Uuid,
        expected: EndpointStatus,
        status: EndpointStatus,
    ) -> Result<bool, CoreError> {
        let pool = self.pool.clone();
        with_retries("set_endpoint_status_if", move || {
            let pool = pool.clone();
            async move {
                let result =
                    sqlx::query("UPDATE endpoints SET status = $3 WHERE uid = $1 AND status = $2")
                        .bind(uid)
                        .bind(expected.as_str())
                        .bind(status.as_str())
                        .execute(&pool)
                        .await?;
                Ok(result.rows_affected() == 1)
            }
        })
        .await
    }

    async fn set_endpoint_last_run(
        &self,
        uid: Uuid,
        when: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE endpoints SET last_run_date = $2 WHERE uid = $1")
            .bind(uid)
            .bind(when)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_endpoint(&self, uid: Uuid) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM endpoints WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO tasks (id, test_suite, test_path, testcases, organization, team, \
             status, kickedoff, endpoint_list, parallelization, endpoint_run, priority, \
             variables, upload_dir, schedule_date, run_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(task.id)
        .bind(&task.test_suite)
        .bind(&task.test_path)
        .bind(serde_json::Value::Array(
            task.testcases
                .iter()
                .map(|t| serde_json::Value::String(t.clone()))
                .collect(),
        ))
        .bind(&task.organization)
        .bind(&task.team)
        .bind(task.status.as_str())
        .bind(task.kickedoff)
        .bind(uuid_list_to_json(&task.endpoint_list))
        .bind(task.parallelization)
        .bind(task.endpoint_run)
        .bind(task.priority.as_i32())
        .bind(&task.variables)
        .bind(&task.upload_dir)
        .bind(task.schedule_date)
        .bind(task.run_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task(&self, id: Uuid) -> Result<Option<TaskRecord>, CoreError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(task_from_row).transpose()
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE tasks SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::TaskNotFound {
                task_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_task_status_if(
        &self,
        id: Uuid,
        expected: TaskStatus,
        status: TaskStatus,
    ) -> Result<bool, CoreError> {
        let pool = self.pool.clone();
        with_retries("set_task_status_if", move || {
            let pool = pool.clone();
            async move {
                let result =
                    sqlx::query("UPDATE tasks SET status = $3 WHERE id = $1 AND status = $2")
                        .bind(id)
                        .bind(expected.as_str())
                        .bind(status.as_str())
                        .execute(&pool)
                        .await?;
                Ok(result.rows_affected() == 1)
            }
        })
        .await
    }

    async fn mark_task_running(
        &self,
        id: Uuid,
        endpoint: Uuid,
        run_date: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE tasks SET status = 'running', endpoint_run = $2, run_date = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(endpoint)
        .bind(run_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_kickedoff(&self, id: Uuid) -> Result<i32, CoreError> {
        let pool = self.pool.clone();
        with_retries("increment_kickedoff", move || {
            let pool = pool.clone();
            async move {
                let row: Option<(i32,)> = sqlx::query_as(
                    "UPDATE tasks SET kickedoff = kickedoff + 1 WHERE id = $1 RETURNING kickedoff",
                )
                .bind(id)
                .fetch_optional(&pool)
                .await?;
                Ok(row)
            }
        })
        .await?
        .map(|(kickedoff,)| kickedoff)
        .ok_or_else(|| CoreError::TaskNotFound {
            task_id: id.to_string(),
        })
    }

    async fn create_queues(&self, endpoint: &EndpointRecord) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for priority in crate::model::PRIORITY_SCAN {
            sqlx::query(
                "INSERT INTO task_queues (endpoint_uid, priority, organization, team) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (endpoint_uid, priority) DO NOTHING",
            )
            .bind(endpoint.uid)
            .bind(priority.as_i32())
            .bind(&endpoint.organization)
            .bind(&endpoint.team)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn queue(&self, key: &QueueKey) -> Result<Option<TaskQueueRecord>, CoreError> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {} FROM task_queues WHERE endpoint_uid = $1 AND priority = $2",
            QUEUE_COLUMNS
        ))
        .bind(key.endpoint)
        .bind(key.priority.as_i32())
        .fetch_optional(&self.pool)
        .await?;
        row.map(queue_from_row).transpose()
    }

    async fn queues_for_endpoint(
        &self,
        endpoint: Uuid,
    ) -> Result<Vec<TaskQueueRecord>, CoreError> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "SELECT {} FROM task_queues WHERE endpoint_uid = $1 ORDER BY priority DESC",
            QUEUE_COLUMNS
        ))
        .bind(endpoint)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(queue_from_row).collect()
    }

    async fn try_lock_queue(&self, key: &QueueKey) -> Result<bool, CoreError> {
        let pool = self.pool.clone();
        let endpoint = key.endpoint;
        let priority = key.priority.as_i32();
        with_retries("try_lock_queue", move || {
            let pool = pool.clone();
            async move {
                let result = sqlx::query(
                    "UPDATE task_queues SET rw_lock = TRUE \
                     WHERE endpoint_uid = $1 AND priority = $2 AND rw_lock = FALSE",
                )
                .bind(endpoint)
                .bind(priority)
                .execute(&pool)
                .await?;
                Ok(result.rows_affected() == 1)
            }
        })
        .await
    }

    async fn unlock_queue(&self, key: &QueueKey) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let endpoint = key.endpoint;
        let priority = key.priority.as_i32();
        with_retries("unlock_queue", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "UPDATE task_queues SET rw_lock = FALSE \
                     WHERE endpoint_uid = $1 AND priority = $2",
                )
                .bind(endpoint)
                .bind(priority)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    async fn pop_queue_head(&self, key: &QueueKey) -> Result<Option<Uuid>, CoreError> {
        let pool = self.pool.clone();
        let endpoint = key.endpoint;
        let priority = key.priority.as_i32();
        with_retries("pop_queue_head", move || {
            let pool = pool.clone();
            async move {
                let row: Option<(Option<Uuid>,)> = sqlx::query_as(
                    "UPDATE task_queues \
                     SET running_task = (tasks->>0)::uuid, tasks = tasks - 0 \
                     WHERE endpoint_uid = $1 AND priority = $2 \
                       AND jsonb_array_length(tasks) > 0 \
                     RETURNING running_task",
                )
                .bind(endpoint)
                .bind(priority)
                .fetch_optional(&pool)
                .await?;
                Ok(row.and_then(|(task,)| task))
            }
        })
        .await
    }

    async fn append_queue_task(&self, key: &QueueKey, task: Uuid) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        let endpoint = key.endpoint;
        let priority = key.priority.as_i32();
        let updated = with_retries("append_queue_task", move || {
            let pool = pool.clone();
            async move {
                let result = sqlx::query(
                    "UPDATE task_queues SET tasks = tasks || to_jsonb($3::text) \
                     WHERE endpoint_uid = $1 AND priority = $2",
                )
                .bind(endpoint)
                .bind(priority)
                .bind(task.to_string())
                .execute(&pool)
                .await?;
                Ok(result.rows_affected())
            }
        })
        .await?;
        if updated == 0 {
            return Err(CoreError::QueueNotFound {
                endpoint: key.endpoint.to_string(),
                priority: key.priority,
            });
        }
        Ok(())
    }

    async fn remove_queue_task(&self, key: &QueueKey, task: Uuid) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE task_queues SET tasks = tasks - $3 \
             WHERE endpoint_uid = $1 AND priority = $2",
        )
        .bind(key.endpoint)
        .bind(key.priority.as_i32())
        .bind(task.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_queue_tasks(
        &self,
        key: &QueueKey,
        tasks: &[Uuid],
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE task_queues SET tasks = $3 WHERE endpoint_uid = $1 AND priority = $2",
        )
        .bind(key.endpoint)
        .bind(key.priority.as_i32())
        .bind(uuid_list_to_json(tasks))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_running_task(
        &self,
        key: &QueueKey,
        task: Option<Uuid>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE task_queues SET running_task = $3 \
             WHERE endpoint_uid = $1 AND priority = $2",
        )
        .bind(key.endpoint)
        .bind(key.priority.as_i32())
        .bind(task)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_containing_task(
        &self,
        task: Uuid,
    ) -> Result<Option<TaskQueueRecord>, CoreError> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {} FROM task_queues WHERE tasks @> to_jsonb($1::text) LIMIT 1",
            QUEUE_COLUMNS
        ))
        .bind(task.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(queue_from_row).transpose()
    }

    async fn mark_queues_to_delete(&self, endpoint: Uuid) -> Result<(), CoreError> {
        sqlx::query("UPDATE task_queues SET to_delete = TRUE WHERE endpoint_uid = $1")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_queues(&self, endpoint: Uuid) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM task_queues WHERE endpoint_uid = $1")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_queue_locks(&self) -> Result<u64, CoreError> {
        let result = sqlx::query("UPDATE task_queues SET rw_lock = FALSE WHERE rw_lock = TRUE")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), CoreError> {
        let code = event.code.map(EventCode::as_i32).ok_or_else(|| {
            CoreError::ValidationError {
                field: "code".to_string(),
                message: "cannot store an event with an unknown code".to_string(),
            }
        })?;
        sqlx::query(
            "INSERT INTO events (id, code, message, organization, team, status, date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(code)
        .bind(&event.message)
        .bind(&event.organization)
        .bind(&event.team)
        .bind(event.status.as_str())
        .bind(event.date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn event(&self, id: Uuid) -> Result<Option<EventRecord>, CoreError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events WHERE id = $1",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(event_from_row).transpose()
    }

    async fn set_event_status(&self, id: Uuid, status: EventStatus) -> Result<(), CoreError> {
        sqlx::query("UPDATE events SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_event_message(
        &self,
        id: Uuid,
        message: &serde_json::Value,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE events SET message = $2 WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_event_queue(&self) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO event_queues (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_lock_event_queue(&self) -> Result<bool, CoreError> {
        let pool = self.pool.clone();
        with_retries("try_lock_event_queue", move || {
            let pool = pool.clone();
            async move {
                let result = sqlx::query(
                    "UPDATE event_queues SET rw_lock = TRUE WHERE id = 1 AND rw_lock = FALSE",
                )
                .execute(&pool)
                .await?;
                Ok(result.rows_affected() == 1)
            }
        })
        .await
    }

    async fn unlock_event_queue(&self) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        with_retries("unlock_event_queue", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("UPDATE event_queues SET rw_lock = FALSE WHERE id = 1")
                    .execute(&pool)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn pop_event_head(&self) -> Result<Option<Uuid>, CoreError> {
        let pool = self.pool.clone();
        with_retries("pop_event_head", move || {
            let pool = pool.clone();
            async move {
                // The CTE snapshots the head before the list shrinks.
                let row: Option<(Option<String>,)> = sqlx::query_as(
                    "WITH head AS ( \
                         SELECT events->>0 AS event_id FROM event_queues \
                         WHERE id = 1 AND jsonb_array_length(events) > 0 \
                         FOR UPDATE \
                     ) \
                     UPDATE event_queues q SET events = q.events - 0 \
                     FROM head WHERE q.id = 1 \
                     RETURNING head.event_id",
                )
                .fetch_optional(&pool)
                .await?;
                Ok(row)
            }
        })
        .await
        .map(|row| {
            row.and_then(|(head,)| head)
                .and_then(|head| Uuid::parse_str(&head).ok())
        })
    }

    async fn append_event(&self, event: Uuid) -> Result<(), CoreError> {
        let pool = self.pool.clone();
        with_retries("append_event", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "UPDATE event_queues SET events = events || to_jsonb($1::text) WHERE id = 1",
                )
                .bind(event.to_string())
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    async fn reset_event_queue_lock(&self) -> Result<bool, CoreError> {
        let result =
            sqlx::query("UPDATE event_queues SET rw_lock = FALSE WHERE id = 1 AND rw_lock = TRUE")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}
