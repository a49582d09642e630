// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-endpoint task loops.
//!
//! Exactly one loop runs per endpoint, keyed by its wake counter entry;
//! creation and wake-ups are serialized through the event dispatcher, so no
//! two loops can ever race for the same endpoint. A loop drains its three
//! priority queues highest-first, runs one child at a time (the endpoint's
//! mutual exclusion), streams output to the room, and exits when a full
//! drain finds nothing and nobody signalled new work.
//!
//! Errors inside one loop are logged and never escape: one misbehaving
//! endpoint must not take the server down.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use testplane_core::{EndpointRecord, PRIORITY_SCAN, QueueKey, TaskQueue, TaskRecord, TaskStatus};

use crate::archive::make_tarball;
use crate::context::ServerContext;
use crate::output::OutputDecoder;
use crate::rooms::{EVENT_TASK_FINISHED, EVENT_TASK_STARTED, EVENT_TEST_REPORT, room_id};
use crate::runner::LaunchSpec;

/// Ensure a task loop exists for the endpoint; if one runs already, bump
/// its wake counter so it does not exit after the current drain.
pub async fn ensure_task_loop(ctx: &Arc<ServerContext>, endpoint: EndpointRecord) {
    if !ctx.loops.claim_or_signal(endpoint.uid).await {
        info!(endpoint = %endpoint.uid, "task loop already running, wake-up scheduled");
        return;
    }

    // Clear locks a crashed predecessor may have left on this endpoint's
    // queues before the new loop starts popping.
    match ctx.store.queues_for_endpoint(endpoint.uid).await {
        Ok(queues) => {
            for queue in queues {
                if let Err(e) = ctx.store.unlock_queue(&queue.key()).await {
                    warn!(queue = %queue.key(), error = %e, "failed to reset queue lock");
                }
            }
        }
        Err(e) => warn!(endpoint = %endpoint.uid, error = %e, "failed to list queues for lock reset"),
    }

    let ctx = ctx.clone();
    tokio::spawn(async move {
        run_task_loop(ctx, endpoint).await;
    });
}

/// The loop body. Runs until the endpoint is deleted or a drain finds no
/// work and no wake-up.
pub async fn run_task_loop(ctx: Arc<ServerContext>, endpoint: EndpointRecord) {
    let uid = endpoint.uid;
    let room = room_id(&endpoint.organization, endpoint.team.as_deref());
    info!(endpoint = %uid, "task loop started");

    loop {
        // Deletion tombstone on any queue aborts the loop and removes the
        // endpoint with all three queues.
        match ctx.store.queues_for_endpoint(uid).await {
            Ok(queues) if queues.is_empty() => {
                error!(endpoint = %uid, "task queues not found, loop has nothing to drain");
                break;
            }
            Ok(queues) if queues.iter().any(|queue| queue.to_delete) => {
                if let Err(e) = ctx.store.delete_queues(uid).await {
                    error!(endpoint = %uid, error = %e, "failed to delete queues");
                }
                if let Err(e) = ctx.store.delete_endpoint(uid).await {
                    error!(endpoint = %uid, error = %e, "failed to delete endpoint");
                }
                info!(endpoint = %uid, "task loop aborted, endpoint deleted");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(endpoint = %uid, error = %e, "failed to reload queues");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        }

        let mut ran_task = false;
        for priority in PRIORITY_SCAN {
            let queue = TaskQueue::new(ctx.store.clone(), QueueKey::new(uid, priority));
            let task = match queue.pop().await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    error!(queue = %queue.key(), error = %e, "pop failed");
                    continue;
                }
            };

            match claim_task(&ctx, &queue, &task).await {
                Ok(true) => {}
                // Race lost: another loop took the task first.
                Ok(false) => break,
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "claim failed");
                    break;
                }
            }

            if let Err(e) = run_one_task(&ctx, &endpoint, &room, &queue, &task).await {
                error!(task_id = %task.id, error = %e, "task run failed");
            }
            ctx.loops.mark_active(uid).await;
            ran_task = true;
            // Start over from the top priority.
            break;
        }

        if !ran_task {
            if ctx.loops.try_exit(uid).await {
                info!(endpoint = %uid, "task loop exits");
                break;
            }
            info!(endpoint = %uid, "running lately scheduled work found during drain");
        }
    }

    ctx.loops.remove(uid).await;
}

/// Atomically claim a popped task via the `kickedoff` counter. Losing the
/// race clears `running_task` and reports false.
async fn claim_task(
    ctx: &Arc<ServerContext>,
    queue: &TaskQueue,
    task: &TaskRecord,
) -> Result<bool, testplane_core::CoreError> {
    if task.kickedoff != 0 && !task.parallelization {
        info!(task_id = %task.id, "task already taken over, skipping");
        ctx.store.set_running_task(&queue.key(), None).await?;
        return Ok(false);
    }
    let kicked = ctx.store.increment_kickedoff(task.id).await?;
    if kicked != 1 && !task.parallelization {
        warn!(task_id = %task.id, kicked, "lost the claim race");
        ctx.store.set_running_task(&queue.key(), None).await?;
        return Ok(false);
    }
    Ok(true)
}

fn assemble_args(
    ctx: &ServerContext,
    endpoint: Uuid,
    task: &TaskRecord,
    result_dir: &std::path::Path,
    variable_file: Option<&std::path::Path>,
) -> Vec<String> {
    let mut args = vec![
        "--loglevel".to_string(),
        "debug".to_string(),
        "--outputdir".to_string(),
        result_dir.display().to_string(),
        "--extension".to_string(),
        "md".to_string(),
        "--consolecolors".to_string(),
        "on".to_string(),
        "--consolemarkers".to_string(),
        "on".to_string(),
    ];
    for testcase in &task.testcases {
        args.push("-t".to_string());
        args.push(testcase.clone());
    }
    if let Some(variable_file) = variable_file {
        args.push("--variablefile".to_string());
        args.push(variable_file.display().to_string());
    }
    let facade = ctx.facade_addr;
    for (name, value) in [
        ("address_daemon", "127.0.0.1".to_string()),
        ("port_daemon", facade.port().to_string()),
        ("task_id", task.id.to_string()),
        ("endpoint_uid", endpoint.to_string()),
    ] {
        args.push("-v".to_string());
        args.push(format!("{}:{}", name, value));
    }
    args.push(
        ctx.scripts_dir()
            .join(&task.test_path)
            .join(format!("{}.md", task.test_suite))
            .display()
            .to_string(),
    );
    args
}

async fn run_one_task(
    ctx: &Arc<ServerContext>,
    endpoint: &EndpointRecord,
    room: &str,
    queue: &TaskQueue,
    task: &TaskRecord,
) -> crate::error::Result<()> {
    let task_id = task.id;
    let task_id_str = task_id.to_string();
    info!(task_id = %task_id, endpoint = %endpoint.uid, "starting task");

    let result_dir = ctx.result_dir(task_id);
    tokio::fs::create_dir_all(&result_dir).await?;

    let variable_file = if task.variables.as_object().is_some_and(|m| !m.is_empty()) {
        let path = result_dir.join("variables.json");
        tokio::fs::write(&path, serde_json::to_vec_pretty(&task.variables)?).await?;
        Some(path)
    } else {
        None
    };

    let spec = LaunchSpec {
        program: ctx.runner_program.clone(),
        args: assemble_args(ctx, endpoint.uid, task, &result_dir, variable_file.as_deref()),
        cwd: None,
        task_id,
    };

    let mut running = match ctx.runner.launch(&spec).await {
        Ok(running) => running,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "launch failed");
            ctx.store
                .set_task_status_if(task_id, TaskStatus::Waiting, TaskStatus::Failed)
                .await?;
            ctx.store.set_running_task(&queue.key(), None).await?;
            return Ok(());
        }
    };

    ctx.processes.register(task_id, running.process.clone());
    ctx.store
        .mark_task_running(task_id, endpoint.uid, Utc::now())
        .await?;
    ctx.task_rooms.insert(task_id_str.clone(), room.to_string());
    ctx.rooms.emit(
        room,
        EVENT_TASK_STARTED,
        serde_json::json!({"task_id": task_id_str}),
    );

    let mut decoder = OutputDecoder::new();
    while let Some(chunk) = running.output.recv().await {
        let text = decoder.feed(&chunk);
        if !text.is_empty() {
            ctx.rooms.append_backlog(room, &task_id_str, &text);
            ctx.rooms.emit(
                room,
                EVENT_TEST_REPORT,
                serde_json::json!({"task_id": task_id_str, "message": text}),
            );
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        ctx.rooms.append_backlog(room, &task_id_str, &tail);
        ctx.rooms.emit(
            room,
            EVENT_TEST_REPORT,
            serde_json::json!({"task_id": task_id_str, "message": tail}),
        );
    }

    let exit_code = running.exit.await.unwrap_or(-1);
    ctx.processes.deregister(task_id);

    // Completion is a guarded transition: a concurrent CANCEL_TASK wins and
    // stays cancelled.
    let next = if exit_code == 0 {
        TaskStatus::Successful
    } else {
        TaskStatus::Failed
    };
    let applied = ctx
        .store
        .set_task_status_if(task_id, TaskStatus::Running, next)
        .await?;
    let final_status = if applied {
        next
    } else {
        ctx.store
            .task(task_id)
            .await?
            .map(|t| t.status)
            .unwrap_or(next)
    };
    info!(task_id = %task_id, exit_code, status = final_status.as_str(), "task finished");

    ctx.rooms.emit(
        room,
        EVENT_TASK_FINISHED,
        serde_json::json!({"task_id": task_id_str, "status": final_status.as_str()}),
    );
    ctx.rooms.free_backlog(room, &task_id_str);
    ctx.task_rooms.remove(&task_id_str);

    ctx.store.set_running_task(&queue.key(), None).await?;
    ctx.store
        .set_endpoint_last_run(endpoint.uid, Utc::now())
        .await?;

    if let Some(upload) = &task.upload_dir {
        let upload_dir = ctx.upload_dir(upload);
        if upload_dir.exists() {
            let dest = result_dir.join("resource.tar.gz");
            let archived =
                tokio::task::spawn_blocking(move || make_tarball(&dest, &upload_dir)).await;
            match archived {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task_id = %task_id, error = %e, "resource archive failed"),
                Err(e) => warn!(task_id = %task_id, error = %e, "archive task panicked"),
            }
        }
    }

    let temp_dir = result_dir.join("temp");
    if temp_dir.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
            warn!(task_id = %task_id, error = %e, "failed to remove temp directory");
        }
    }

    Ok(())
}
