// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Websocket hub: endpoint channels and browser fan-out.
//!
//! Three routes:
//!
//! - `/rpc`: endpoint control channel. One JSON handshake, a literal reply,
//!   then the socket becomes a JSON-RPC session owned by a proxy slot.
//! - `/msg`: endpoint message channel. Push-only `{task_id, data}` frames
//!   relayed to the task's room as `test log` events.
//! - `/ws`: browser sockets. `join`/`leave` commands subscribe the socket
//!   to rooms; joining with a task id replays the task's backlog first.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use testplane_core::{EndpointRecord, EndpointStatus};
use testplane_proxy::{
    Handshake, ProxySlot, REPLY_FORBIDDEN, REPLY_OK, REPLY_UNAUTHORIZED, RpcResponse, StreamFrame,
    proxy_path,
};

use crate::context::ServerContext;
use crate::rooms::{EVENT_BACKLOG, EVENT_TEST_LOG, OutboundFrame, room_id};

/// Routes served by the hub.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/rpc", get(rpc_upgrade))
        .route("/msg", get(msg_upgrade))
        .route("/ws", get(browser_upgrade))
        .with_state(ctx)
}

async fn rpc_upgrade(State(ctx): State<Arc<ServerContext>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| rpc_session(ctx, socket))
}

async fn msg_upgrade(State(ctx): State<Arc<ServerContext>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| msg_session(ctx, socket))
}

async fn browser_upgrade(State(ctx): State<Arc<ServerContext>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| browser_session(ctx, socket))
}

/// Outcome of the control-channel handshake.
enum Admission {
    /// Endpoint may stay; carries the slot path.
    Admitted(String),
    /// Endpoint told to go away with the given literal reply.
    Refused(&'static str),
}

/// Decide whether a handshake may stay connected. An unknown uid gets a row
/// with status Unauthorized so an admin can authorize it later.
async fn admit(ctx: &Arc<ServerContext>, handshake: &Handshake) -> Option<Admission> {
    let uid = match Uuid::parse_str(&handshake.uid) {
        Ok(uid) => uid,
        Err(_) => {
            warn!(uid = %handshake.uid, "handshake with a malformed uid");
            return None;
        }
    };
    match ctx.store.endpoint(uid).await {
        Ok(Some(endpoint)) => match endpoint.status {
            EndpointStatus::Forbidden => Some(Admission::Refused(REPLY_FORBIDDEN)),
            EndpointStatus::Unauthorized => Some(Admission::Refused(REPLY_UNAUTHORIZED)),
            EndpointStatus::Offline | EndpointStatus::Online => Some(Admission::Admitted(
                proxy_path(&handshake.uid, &handshake.backing_file),
            )),
        },
        Ok(None) => {
            let endpoint = EndpointRecord::new(uid, handshake.join_id.clone(), None);
            if let Err(e) = ctx.store.insert_endpoint(&endpoint).await {
                error!(uid = %uid, error = %e, "failed to create unauthorized endpoint row");
                return None;
            }
            info!(uid = %uid, join_id = %handshake.join_id, "new endpoint recorded as Unauthorized");
            Some(Admission::Refused(REPLY_UNAUTHORIZED))
        }
        Err(e) => {
            error!(uid = %uid, error = %e, "endpoint lookup failed during handshake");
            None
        }
    }
}

async fn rpc_session(ctx: Arc<ServerContext>, mut socket: WebSocket) {
    let handshake = match socket.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Handshake>(&text) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(error = %e, "unparseable control-channel handshake");
                return;
            }
        },
        _ => return,
    };

    let path = match admit(&ctx, &handshake).await {
        Some(Admission::Admitted(path)) => path,
        Some(Admission::Refused(reply)) => {
            let _ = socket.send(Message::Text(reply.into())).await;
            return;
        }
        None => return,
    };
    if socket.send(Message::Text(REPLY_OK.into())).await.is_err() {
        return;
    }

    let (slot, mut outbound) = ProxySlot::channel(path.clone());
    ctx.registry.register(slot.clone());
    info!(path = %path, join_id = %handshake.join_id, "endpoint control channel up");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(request) = outbound.recv().await {
            let frame = match serde_json::to_string(&request) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "failed to encode RPC request");
                    continue;
                }
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            // A newer connection under the same path displaces this session.
            _ = slot.closed() => {
                debug!(path = %path, "slot displaced, closing session");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RpcResponse>(&text) {
                        Ok(response) => slot.complete(response),
                        Err(e) => {
                            debug!(path = %path, error = %e, "non-response frame on control channel")
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    slot.fail_all_pending("endpoint disconnected");
    ctx.registry.remove_if_current(&slot);
    writer.abort();
    info!(path = %path, "endpoint control channel down");
}

async fn msg_session(ctx: Arc<ServerContext>, mut socket: WebSocket) {
    while let Some(frame) = socket.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(frame) = serde_json::from_str::<StreamFrame>(&text) else {
            debug!("unparseable message-channel frame");
            continue;
        };
        // Daemon-level messages carry no task and are not fanned out.
        if frame.task_id.is_empty() {
            continue;
        }
        let Some(room) = resolve_task_room(&ctx, &frame.task_id).await else {
            warn!(task_id = %frame.task_id, "message for an unknown task");
            continue;
        };
        ctx.rooms.emit(
            &room,
            EVENT_TEST_LOG,
            serde_json::json!({"task_id": frame.task_id, "message": frame.data}),
        );
    }
}

async fn resolve_task_room(ctx: &Arc<ServerContext>, task_id: &str) -> Option<String> {
    if let Some(room) = ctx.task_rooms.get(task_id) {
        return Some(room.clone());
    }
    let id = Uuid::parse_str(task_id).ok()?;
    let task = ctx.store.task(id).await.ok().flatten()?;
    let room = room_id(&task.organization, task.team.as_deref());
    ctx.task_rooms.insert(task_id.to_string(), room.clone());
    Some(room)
}

/// One `join`/`leave` command from a browser socket.
#[derive(Debug, Deserialize)]
struct BrowserCommand {
    action: String,
    organization: String,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

async fn browser_session(ctx: Arc<ServerContext>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // room -> subscriber id of this socket
    let mut joined: std::collections::HashMap<String, u64> = std::collections::HashMap::new();

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(command) = serde_json::from_str::<BrowserCommand>(&text) else {
            debug!("unparseable browser command");
            continue;
        };
        let room = room_id(&command.organization, command.team.as_deref());

        match command.action.as_str() {
            "join" => {
                if !joined.contains_key(&room) {
                    let (id, mut rx) = ctx.rooms.subscribe(&room);
                    joined.insert(room.clone(), id);
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        while let Some(frame) = rx.recv().await {
                            if out_tx.send(frame).is_err() {
                                break;
                            }
                        }
                    });
                }
                // Late joiner catching up on one task's console output.
                if let Some(task_id) = &command.task_id
                    && let Some(backlog) = ctx.rooms.backlog(&room, task_id)
                {
                    let _ = out_tx.send(OutboundFrame {
                        event: EVENT_BACKLOG.to_string(),
                        data: serde_json::json!({"task_id": task_id, "message": backlog}),
                    });
                }
            }
            "leave" => {
                if let Some(id) = joined.remove(&room) {
                    ctx.rooms.unsubscribe(&room, id);
                }
            }
            other => debug!(action = other, "unknown browser command"),
        }
    }

    for (room, id) in joined {
        ctx.rooms.unsubscribe(&room, id);
    }
    writer.abort();
}
