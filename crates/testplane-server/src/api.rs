// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST surface the core exposes to web clients.
//!
//! Thin handlers: validate, touch the store, post events. All queue
//! mutations that need coordination go through the event bus; the only
//! direct queue writes here are the ones the contract defines as immediate
//! (task creation pushes, reorder flush + re-push).

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use testplane_core::{
    CoreError, EndpointRecord, EndpointStatus, EventCode, Priority, QueueKey, TaskQueue,
    TaskRecord, TaskStatus,
};

use crate::context::ServerContext;
use crate::events::push_event;
use crate::heartbeat::probe_endpoint;

/// Routes of the REST surface.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/task", post(create_task).delete(cancel_task))
        .route("/api/task/{id}", get(get_task))
        .route("/api/taskqueue", get(list_queues).post(reorder_queue))
        .route("/api/endpoint", get(list_endpoints).delete(delete_endpoint))
        .route("/api/endpoint/authorize", post(authorize_endpoint))
        .route("/api/endpoint/forbid", post(forbid_endpoint))
        .route("/api/endpoint/check", post(check_endpoint))
        .route("/api/endpoint/config", post(request_endpoint_config))
        .with_state(ctx)
}

/// Wire error: HTTP status plus `{code, message}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::EndpointNotFound { .. }
            | CoreError::TaskNotFound { .. }
            | CoreError::QueueNotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::ValidationError { .. } => StatusCode::BAD_REQUEST,
            // Retryable: queue busy beyond its budget.
            CoreError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.error_code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"code": self.code, "message": self.message})),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn success() -> Json<serde_json::Value> {
    Json(json!({"code": "SUCCESS"}))
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value).map_err(|_| ApiError::invalid(format!("{} is not a valid uuid", field)))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    test_suite: String,
    test_path: String,
    organization: String,
    #[serde(default)]
    team: Option<String>,
    endpoint_list: Vec<String>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    parallelization: bool,
    #[serde(default)]
    variables: Option<serde_json::Value>,
    #[serde(default)]
    testcases: Vec<String>,
    #[serde(default)]
    upload_dir: Option<String>,
}

async fn create_task(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult {
    if request.test_suite.is_empty() {
        return Err(ApiError::invalid("test_suite is required"));
    }
    if request.endpoint_list.is_empty() {
        return Err(ApiError::invalid("endpoint_list must not be empty"));
    }
    let priority = match request.priority {
        Some(value) => Priority::from_i32(value).map_err(ApiError::from)?,
        None => Priority::Default,
    };
    let mut endpoints = Vec::with_capacity(request.endpoint_list.len());
    for raw in &request.endpoint_list {
        endpoints.push(parse_uuid("endpoint_list", raw)?);
    }

    // The fan-out set must be fully resolvable before anything is queued.
    for uid in &endpoints {
        if ctx.store.endpoint(*uid).await?.is_none() {
            return Err(ApiError::not_found(format!("endpoint '{}' not found", uid)));
        }
        let key = QueueKey::new(*uid, priority);
        if ctx.store.queue(&key).await?.is_none() {
            return Err(ApiError::not_found(format!(
                "task queue '{}' not found, authorize the endpoint first",
                key
            )));
        }
    }

    let mut task = TaskRecord::new(
        &request.test_suite,
        &request.test_path,
        &request.organization,
        request.team.clone(),
    );
    task.endpoint_list = endpoints.clone();
    task.priority = priority;
    task.parallelization = request.parallelization;
    task.testcases = request.testcases.clone();
    task.upload_dir = request.upload_dir.clone();
    if let Some(variables) = &request.variables {
        if !variables.is_object() {
            return Err(ApiError::invalid("variables must be an object"));
        }
        task.variables = variables.clone();
    }
    ctx.store.insert_task(&task).await?;

    for uid in &endpoints {
        let queue = TaskQueue::new(ctx.store.clone(), QueueKey::new(*uid, priority));
        queue.push(task.id).await?;
        push_event(
            &ctx,
            &request.organization,
            request.team.clone(),
            EventCode::StartTask,
            json!({"endpoint_uid": uid.to_string()}),
        )
        .await?;
    }

    info!(task_id = %task.id, endpoints = endpoints.len(), "task created");
    Ok(Json(json!({"code": "SUCCESS", "task_id": task.id.to_string()})))
}

#[derive(Debug, Deserialize)]
struct CancelTaskRequest {
    task_id: String,
    #[serde(default)]
    endpoint_uid: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
}

async fn cancel_task(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<CancelTaskRequest>,
) -> ApiResult {
    let task_id = parse_uuid("task_id", &request.task_id)?;
    let Some(task) = ctx.store.task(task_id).await? else {
        return Err(ApiError::not_found(format!("task '{}' not found", task_id)));
    };
    let priority = match request.priority {
        Some(value) => Priority::from_i32(value).map_err(ApiError::from)?,
        None => task.priority,
    };

    push_event(
        &ctx,
        &task.organization,
        task.team.clone(),
        EventCode::CancelTask,
        json!({
            "task_id": task_id.to_string(),
            "endpoint_uid": request.endpoint_uid.unwrap_or_default(),
            "priority": priority.as_i32(),
        }),
    )
    .await?;
    Ok(success())
}

async fn get_task(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult {
    let task_id = parse_uuid("task_id", &id)?;
    let Some(task) = ctx.store.task(task_id).await? else {
        return Err(ApiError::not_found(format!("task '{}' not found", task_id)));
    };
    Ok(Json(json!({
        "code": "SUCCESS",
        "task": {
            "task_id": task.id.to_string(),
            "test_suite": task.test_suite,
            "status": task.status.as_str(),
            "priority": task.priority.as_i32(),
            "endpoint_run": task.endpoint_run.map(|uid| uid.to_string()),
            "run_date": task.run_date.map(|at| at.to_rfc3339()),
        },
    })))
}

#[derive(Debug, Deserialize)]
struct ListQueuesQuery {
    #[serde(default)]
    uid: Option<String>,
}

async fn list_queues(
    State(ctx): State<Arc<ServerContext>>,
    Query(query): Query<ListQueuesQuery>,
) -> ApiResult {
    let endpoints = match &query.uid {
        Some(raw) => {
            let uid = parse_uuid("uid", raw)?;
            match ctx.store.endpoint(uid).await? {
                Some(endpoint) => vec![endpoint],
                None => return Err(ApiError::not_found(format!("endpoint '{}' not found", uid))),
            }
        }
        None => ctx.store.list_endpoints().await?,
    };

    let mut queues = Vec::new();
    for endpoint in &endpoints {
        for queue in ctx.store.queues_for_endpoint(endpoint.uid).await? {
            queues.push(json!({
                "endpoint_uid": endpoint.uid.to_string(),
                "endpoint": endpoint.name,
                "status": endpoint.status.as_str(),
                "priority": queue.priority.as_i32(),
                "waiting": queue.tasks.len(),
                "running_task": queue.running_task.map(|id| id.to_string()),
                "tasks": queue.tasks.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            }));
        }
    }
    Ok(Json(json!({"code": "SUCCESS", "task_queues": queues})))
}

#[derive(Debug, Deserialize)]
struct ReorderRequest {
    endpoint_uid: String,
    priority: i32,
    tasks: Vec<String>,
}

async fn reorder_queue(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<ReorderRequest>,
) -> ApiResult {
    let endpoint = parse_uuid("endpoint_uid", &request.endpoint_uid)?;
    let priority = Priority::from_i32(request.priority).map_err(ApiError::from)?;
    let key = QueueKey::new(endpoint, priority);
    let Some(queue_record) = ctx.store.queue(&key).await? else {
        return Err(ApiError::not_found(format!("task queue '{}' not found", key)));
    };

    let mut requested = Vec::with_capacity(request.tasks.len());
    for raw in &request.tasks {
        let id = parse_uuid("tasks", raw)?;
        if !queue_record.tasks.contains(&id) {
            return Err(ApiError::invalid(format!(
                "task '{}' is not waiting in queue '{}'",
                id, key
            )));
        }
        requested.push(id);
    }

    let queue = TaskQueue::new(ctx.store.clone(), key);
    queue.flush(false).await?;

    // Tasks omitted from the new order are cancelled, not re-queued.
    for dropped in queue_record
        .tasks
        .iter()
        .filter(|id| !requested.contains(id))
    {
        ctx.store
            .set_task_status_if(*dropped, TaskStatus::Waiting, TaskStatus::Cancelled)
            .await?;
    }
    for id in &requested {
        queue.push(*id).await?;
    }
    info!(queue = %key, kept = requested.len(), "queue reordered");
    Ok(success())
}

#[derive(Debug, Deserialize)]
struct ListEndpointsQuery {
    #[serde(default)]
    forbidden: Option<bool>,
    #[serde(default)]
    unauthorized: Option<bool>,
}

async fn list_endpoints(
    State(ctx): State<Arc<ServerContext>>,
    Query(query): Query<ListEndpointsQuery>,
) -> ApiResult {
    let forbidden = query.forbidden.unwrap_or(false);
    let unauthorized = query.unauthorized.unwrap_or(false);
    let endpoints: Vec<_> = ctx
        .store
        .list_endpoints()
        .await?
        .into_iter()
        .filter(|endpoint| {
            if forbidden || unauthorized {
                (forbidden && endpoint.status == EndpointStatus::Forbidden)
                    || (unauthorized && endpoint.status == EndpointStatus::Unauthorized)
            } else {
                // Forbidden rows only show up when explicitly requested.
                endpoint.status != EndpointStatus::Forbidden
            }
        })
        .map(|endpoint| {
            json!({
                "endpoint_uid": endpoint.uid.to_string(),
                "name": endpoint.name,
                "organization": endpoint.organization,
                "team": endpoint.team,
                "status": endpoint.status.as_str(),
                "last_run_date": endpoint.last_run_date.map(|at| at.to_rfc3339()),
            })
        })
        .collect();
    Ok(Json(json!({"code": "SUCCESS", "endpoints": endpoints})))
}

#[derive(Debug, Deserialize)]
struct EndpointUidRequest {
    endpoint_uid: String,
}

async fn authorize_endpoint(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<EndpointUidRequest>,
) -> ApiResult {
    let uid = parse_uuid("endpoint_uid", &request.endpoint_uid)?;
    let name = format!("Test Site {}", rand::rng().random_range(1..10000));

    let endpoint = match ctx.store.endpoint(uid).await? {
        Some(mut endpoint) => {
            endpoint.name = name;
            endpoint.status = EndpointStatus::Offline;
            ctx.store.update_endpoint(&endpoint).await?;
            endpoint
        }
        None => {
            let mut endpoint = EndpointRecord::new(uid, "", None);
            endpoint.name = name;
            endpoint.status = EndpointStatus::Offline;
            ctx.store.insert_endpoint(&endpoint).await?;
            endpoint
        }
    };
    ctx.store.create_queues(&endpoint).await?;
    info!(endpoint = %uid, "endpoint authorized");

    // Probe in the background so the row flips Online soon after.
    let store = ctx.store.clone();
    let registry = ctx.registry.clone();
    tokio::spawn(async move {
        if let Err(e) =
            probe_endpoint(&store, &registry, uid, std::time::Duration::from_secs(5)).await
        {
            warn!(endpoint = %uid, error = %e, "post-authorize probe failed");
        }
    });
    Ok(success())
}

async fn forbid_endpoint(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<EndpointUidRequest>,
) -> ApiResult {
    let uid = parse_uuid("endpoint_uid", &request.endpoint_uid)?;
    match ctx.store.endpoint(uid).await? {
        Some(mut endpoint) => {
            endpoint.status = EndpointStatus::Forbidden;
            ctx.store.update_endpoint(&endpoint).await?;
        }
        None => {
            let mut endpoint = EndpointRecord::new(uid, "", None);
            endpoint.status = EndpointStatus::Forbidden;
            ctx.store.insert_endpoint(&endpoint).await?;
        }
    }
    info!(endpoint = %uid, "endpoint forbidden");
    Ok(success())
}

async fn delete_endpoint(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<EndpointUidRequest>,
) -> ApiResult {
    let uid = parse_uuid("endpoint_uid", &request.endpoint_uid)?;
    let Some(endpoint) = ctx.store.endpoint(uid).await? else {
        return Err(ApiError::not_found(format!("endpoint '{}' not found", uid)));
    };

    let queues = ctx.store.queues_for_endpoint(uid).await?;
    if queues.is_empty() {
        // Never authorized: no loop to wake, drop the row directly.
        ctx.store.delete_endpoint(uid).await?;
        return Ok(success());
    }

    ctx.store.mark_queues_to_delete(uid).await?;
    for record in &queues {
        let queue = TaskQueue::new(ctx.store.clone(), record.key());
        queue.flush(true).await?;
        if let Some(running) = record.running_task {
            push_event(
                &ctx,
                &endpoint.organization,
                endpoint.team.clone(),
                EventCode::CancelTask,
                json!({
                    "task_id": running.to_string(),
                    "endpoint_uid": uid.to_string(),
                    "priority": record.priority.as_i32(),
                }),
            )
            .await?;
        }
    }
    // Wake the loop (or spawn one) so it observes the tombstone and exits.
    push_event(
        &ctx,
        &endpoint.organization,
        endpoint.team.clone(),
        EventCode::StartTask,
        json!({"endpoint_uid": uid.to_string(), "to_delete": true}),
    )
    .await?;
    info!(endpoint = %uid, "endpoint deletion scheduled");
    Ok(success())
}

async fn request_endpoint_config(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<EndpointUidRequest>,
) -> ApiResult {
    let uid = parse_uuid("endpoint_uid", &request.endpoint_uid)?;
    let Some(endpoint) = ctx.store.endpoint(uid).await? else {
        return Err(ApiError::not_found(format!("endpoint '{}' not found", uid)));
    };
    // Answer lands on the event record once the dispatcher forwarded it.
    let event_id = push_event(
        &ctx,
        &endpoint.organization,
        endpoint.team.clone(),
        EventCode::GetEndpointConfig,
        json!({"endpoint_uid": uid.to_string()}),
    )
    .await?;
    Ok(Json(json!({"code": "SUCCESS", "event_id": event_id.to_string()})))
}

async fn check_endpoint(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<EndpointUidRequest>,
) -> ApiResult {
    let uid = parse_uuid("endpoint_uid", &request.endpoint_uid)?;
    if ctx.store.endpoint(uid).await?.is_none() {
        return Err(ApiError::not_found(format!("endpoint '{}' not found", uid)));
    }
    let online = probe_endpoint(
        &ctx.store,
        &ctx.registry,
        uid,
        std::time::Duration::from_secs(5),
    )
    .await?;
    Ok(Json(json!({"code": "SUCCESS", "online": online})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runner::MockRunner;
    use testplane_core::{EventStatus, MemoryStore, Store};

    async fn fixture() -> Arc<ServerContext> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        ServerContext::new(store, Arc::new(MockRunner::new()), &Config::default())
            .await
            .unwrap()
    }

    async fn authorized_endpoint(ctx: &Arc<ServerContext>) -> Uuid {
        let uid = Uuid::new_v4();
        authorize_endpoint(
            State(ctx.clone()),
            Json(EndpointUidRequest {
                endpoint_uid: uid.to_string(),
            }),
        )
        .await
        .unwrap();
        uid
    }

    fn create_request(uid: Uuid) -> CreateTaskRequest {
        CreateTaskRequest {
            test_suite: "smoke".to_string(),
            test_path: "suites".to_string(),
            organization: "org-1".to_string(),
            team: None,
            endpoint_list: vec![uid.to_string()],
            priority: None,
            parallelization: false,
            variables: None,
            testcases: Vec::new(),
            upload_dir: None,
        }
    }

    #[tokio::test]
    async fn test_authorize_creates_three_queues_and_offline_row() {
        let ctx = fixture().await;
        let uid = authorized_endpoint(&ctx).await;

        let endpoint = ctx.store.endpoint(uid).await.unwrap().unwrap();
        assert_eq!(endpoint.status, EndpointStatus::Offline);
        assert!(endpoint.name.starts_with("Test Site "));
        assert_eq!(ctx.store.queues_for_endpoint(uid).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_task_pushes_queue_and_event() {
        let ctx = fixture().await;
        let uid = authorized_endpoint(&ctx).await;

        let response = create_task(State(ctx.clone()), Json(create_request(uid)))
            .await
            .unwrap();
        let task_id = response.0["task_id"].as_str().unwrap().to_string();
        let task_id = Uuid::parse_str(&task_id).unwrap();

        let queue = ctx
            .store
            .queue(&QueueKey::new(uid, Priority::Default))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.tasks, vec![task_id]);

        let event = ctx.events.pop().await.unwrap().unwrap();
        assert_eq!(event.code, Some(EventCode::StartTask));
        assert_eq!(event.status, EventStatus::Triggered);
        assert_eq!(
            event.message["endpoint_uid"].as_str().unwrap(),
            uid.to_string()
        );
    }

    #[tokio::test]
    async fn test_create_task_rejects_unknown_endpoint() {
        let ctx = fixture().await;
        let err = create_task(State(ctx.clone()), Json(create_request(Uuid::new_v4())))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let mut request = create_request(Uuid::new_v4());
        request.endpoint_list.clear();
        let err = create_task(State(ctx), Json(request)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_task_posts_event() {
        let ctx = fixture().await;
        let uid = authorized_endpoint(&ctx).await;
        let response = create_task(State(ctx.clone()), Json(create_request(uid)))
            .await
            .unwrap();
        let task_id = response.0["task_id"].as_str().unwrap().to_string();

        // Drain the START_TASK first.
        ctx.events.pop().await.unwrap().unwrap();

        cancel_task(
            State(ctx.clone()),
            Json(CancelTaskRequest {
                task_id: task_id.clone(),
                endpoint_uid: Some(uid.to_string()),
                priority: None,
            }),
        )
        .await
        .unwrap();

        let event = ctx.events.pop().await.unwrap().unwrap();
        assert_eq!(event.code, Some(EventCode::CancelTask));
        assert_eq!(event.message["task_id"].as_str().unwrap(), task_id);
    }

    #[tokio::test]
    async fn test_reorder_cancels_dropped_tasks() {
        let ctx = fixture().await;
        let uid = authorized_endpoint(&ctx).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let response = create_task(State(ctx.clone()), Json(create_request(uid)))
                .await
                .unwrap();
            ids.push(
                Uuid::parse_str(response.0["task_id"].as_str().unwrap()).unwrap(),
            );
        }

        // New order: last first, middle dropped.
        reorder_queue(
            State(ctx.clone()),
            Json(ReorderRequest {
                endpoint_uid: uid.to_string(),
                priority: Priority::Default.as_i32(),
                tasks: vec![ids[2].to_string(), ids[0].to_string()],
            }),
        )
        .await
        .unwrap();

        let queue = ctx
            .store
            .queue(&QueueKey::new(uid, Priority::Default))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.tasks, vec![ids[2], ids[0]]);
        let dropped = ctx.store.task(ids[1]).await.unwrap().unwrap();
        assert_eq!(dropped.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reorder_rejects_foreign_task() {
        let ctx = fixture().await;
        let uid = authorized_endpoint(&ctx).await;
        let err = reorder_queue(
            State(ctx.clone()),
            Json(ReorderRequest {
                endpoint_uid: uid.to_string(),
                priority: Priority::Default.as_i32(),
                tasks: vec![Uuid::new_v4().to_string()],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_endpoint_tombstones_and_cancels() {
        let ctx = fixture().await;
        let uid = authorized_endpoint(&ctx).await;
        let response = create_task(State(ctx.clone()), Json(create_request(uid)))
            .await
            .unwrap();
        let task_id = Uuid::parse_str(response.0["task_id"].as_str().unwrap()).unwrap();
        ctx.events.pop().await.unwrap().unwrap(); // drain START_TASK

        delete_endpoint(
            State(ctx.clone()),
            Json(EndpointUidRequest {
                endpoint_uid: uid.to_string(),
            }),
        )
        .await
        .unwrap();

        // Waiting work is cancelled and every queue wears the tombstone.
        let task = ctx.store.task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        for queue in ctx.store.queues_for_endpoint(uid).await.unwrap() {
            assert!(queue.to_delete);
            assert!(queue.tasks.is_empty());
        }
        // The wake event carries the tombstone marker.
        let event = ctx.events.pop().await.unwrap().unwrap();
        assert_eq!(event.code, Some(EventCode::StartTask));
        assert_eq!(event.message["to_delete"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_forbid_then_listing_filters() {
        let ctx = fixture().await;
        let uid = authorized_endpoint(&ctx).await;
        forbid_endpoint(
            State(ctx.clone()),
            Json(EndpointUidRequest {
                endpoint_uid: uid.to_string(),
            }),
        )
        .await
        .unwrap();

        let all = list_endpoints(
            State(ctx.clone()),
            Query(ListEndpointsQuery {
                forbidden: None,
                unauthorized: None,
            }),
        )
        .await
        .unwrap();
        assert!(all.0["endpoints"].as_array().unwrap().is_empty());

        let forbidden = list_endpoints(
            State(ctx.clone()),
            Query(ListEndpointsQuery {
                forbidden: Some(true),
                unauthorized: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(forbidden.0["endpoints"].as_array().unwrap().len(), 1);
    }
}
