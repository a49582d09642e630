// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local XML-RPC facade.
//!
//! Test-runner child processes speak XML-RPC to a fixed local port; the
//! request path selects the proxy slot (`uid[/backing_file]`) and each call
//! is forwarded across the matching control channel, blocking the caller
//! until the remote reply arrives. A missing slot answers with an empty
//! list/nil so lookups stay idempotent while an endpoint restarts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use crate::protocol::KeywordResult;
use crate::slot::{ProxyError, ProxyRegistry};
use crate::xmlrpc::{self, MethodCall, Value};

/// Default bind address of the facade.
pub const DEFAULT_FACADE_PORT: u16 = 8270;

/// Budget for one forwarded keyword call. Tests may run arbitrarily long
/// keywords; cancellation of a hung run goes through CANCEL_TASK, not here.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Clone)]
struct FacadeState {
    registry: Arc<ProxyRegistry>,
    call_timeout: Duration,
}

/// Build the facade router. Any path is accepted; the path is the slot key.
pub fn router(registry: Arc<ProxyRegistry>, call_timeout: Duration) -> Router {
    Router::new()
        .fallback(handle_xmlrpc)
        .with_state(FacadeState {
            registry,
            call_timeout,
        })
}

/// Serve the facade until the listener fails.
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<ProxyRegistry>,
    call_timeout: Duration,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "XML-RPC facade listening");
    axum::serve(listener, router(registry, call_timeout)).await
}

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        body,
    )
        .into_response()
}

async fn handle_xmlrpc(State(state): State<FacadeState>, uri: Uri, body: String) -> Response {
    let path = uri.path().trim_matches('/').to_string();
    let call = match xmlrpc::parse_method_call(&body) {
        Ok(call) => call,
        Err(e) => {
            warn!(path = %path, error = %e, "rejecting malformed XML-RPC request");
            return xml_response(xmlrpc::render_fault(1, &e.to_string()));
        }
    };

    debug!(path = %path, method = %call.method, "facade call");
    let body = match dispatch(&state, &path, call).await {
        Ok(value) => xmlrpc::render_response(&value),
        Err(fault) => xmlrpc::render_fault(1, &fault),
    };
    xml_response(body)
}

/// Forward one parsed call to its slot. Returns the response value or a
/// fault string.
async fn dispatch(state: &FacadeState, path: &str, call: MethodCall) -> Result<Value, String> {
    let slot = state.registry.get(path);
    let params = serde_json::Value::Array(call.params.iter().map(xmlrpc::to_json).collect());

    match call.method.as_str() {
        "get_keyword_names" => match slot {
            // Idempotent during endpoint restarts: no slot means no keywords.
            None => Ok(Value::Array(Vec::new())),
            Some(slot) => slot
                .call("get_keyword_names", params, state.call_timeout)
                .await
                .map(|result| xmlrpc::from_json(&result))
                .map_err(|e| e.to_string()),
        },
        "run_keyword" => match slot {
            None => Ok(Value::Nil),
            Some(slot) => match slot.call("run_keyword", params, state.call_timeout).await {
                Ok(result) => Ok(xmlrpc::from_json(&result)),
                // A dropped control channel yields a synthetic FAIL result so
                // the harness sees a keyword failure, not a transport error.
                Err(e @ ProxyError::Disconnected { .. }) => {
                    let synthetic = serde_json::to_value(KeywordResult::fail(e.to_string()))
                        .unwrap_or(serde_json::Value::Null);
                    Ok(xmlrpc::from_json(&synthetic))
                }
                Err(e) => Err(e.to_string()),
            },
        },
        "get_keyword_arguments" | "get_keyword_documentation" | "get_keyword_tags" => match slot {
            None => Ok(Value::Nil),
            Some(slot) => slot
                .call(&call.method, params, state.call_timeout)
                .await
                .map(|result| xmlrpc::from_json(&result))
                .map_err(|e| e.to_string()),
        },
        other => Err(format!("method \"{}\" is not supported", other)),
    }
}
