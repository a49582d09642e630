// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker-side connector.
//!
//! Holds the control channel (`/rpc`) against the server, answers its
//! JSON-RPC keyword calls, and reconnects with a linear backoff whenever
//! the server closes the socket. The server never re-opens a connection;
//! resurrecting after a drop is entirely the agent's job. Live output goes
//! over a separate message channel (`/msg`) so a blocking keyword call
//! never stalls streaming.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use testplane_proxy::{
    Handshake, KeywordResult, REPLY_FORBIDDEN, REPLY_OK, REPLY_UNAUTHORIZED, RpcRequest,
    RpcResponse, StreamFrame,
};

use crate::library::KeywordLibrary;

/// Agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Websocket connect/read/write failed.
    #[error("websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON encoding/decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server spoke something other than the handshake contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// How one control-channel session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server replied `"Unauthorized"`; an admin has not allowed us yet.
    Unauthorized,
    /// Server replied `"Forbidden"`; we are blacklisted.
    Forbidden,
    /// Session served until the socket closed.
    Closed,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:5000`.
    pub server_url: String,
    /// Organization (or team) identifier to join.
    pub join_id: String,
    /// Our endpoint uid, stable across reconnects.
    pub uid: String,
    /// Backing-file suffix disambiguating the proxy slot; empty for the
    /// daemon-level connection.
    pub backing_file: String,
    /// Linear reconnect backoff between sessions.
    pub reconnect_delay: Duration,
    /// Give up after this many sessions; `None` retries forever.
    pub max_sessions: Option<u32>,
}

impl AgentConfig {
    /// Config with default backoff for the given identity.
    pub fn new(
        server_url: impl Into<String>,
        join_id: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            join_id: join_id.into(),
            uid: uid.into(),
            backing_file: String::new(),
            reconnect_delay: Duration::from_secs(5),
            max_sessions: None,
        }
    }
}

/// The worker-side connector.
pub struct Agent {
    config: AgentConfig,
    library: Arc<dyn KeywordLibrary>,
    /// Reported on `get_endpoint_config` admin calls.
    config_info: Value,
}

impl Agent {
    /// Bind a library to a connection identity.
    pub fn new(config: AgentConfig, library: Arc<dyn KeywordLibrary>) -> Self {
        let config_info = serde_json::json!({
            "uid": config.uid,
            "join_id": config.join_id,
            "backing_file": config.backing_file,
        });
        Self {
            config,
            library,
            config_info,
        }
    }

    /// Keep a control channel alive: connect, serve, back off, reconnect.
    /// Returns the end state of the last session.
    pub async fn run(&self) -> Result<SessionEnd, AgentError> {
        let mut sessions = 0;
        loop {
            let end = match self.serve_once().await {
                Ok(end) => end,
                Err(e) => {
                    warn!(error = %e, "control channel session failed");
                    SessionEnd::Closed
                }
            };
            sessions += 1;
            if let Some(max) = self.config.max_sessions
                && sessions >= max
            {
                return Ok(end);
            }
            match end {
                SessionEnd::Unauthorized => {
                    info!("not authorized yet, retrying after backoff");
                }
                SessionEnd::Forbidden => {
                    warn!("server forbids this endpoint, retrying after backoff");
                }
                SessionEnd::Closed => {
                    info!("control channel closed, reconnecting after backoff");
                }
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One control-channel session: handshake, then answer calls until the
    /// socket closes.
    pub async fn serve_once(&self) -> Result<SessionEnd, AgentError> {
        let url = format!("{}/rpc", self.config.server_url);
        let (mut ws, _) = connect_async(url.as_str()).await?;

        let handshake = Handshake {
            join_id: self.config.join_id.clone(),
            uid: self.config.uid.clone(),
            backing_file: self.config.backing_file.clone(),
        };
        ws.send(Message::Text(serde_json::to_string(&handshake)?))
            .await?;

        let reply = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(_)) | None => {
                return Err(AgentError::Protocol(
                    "server closed before answering the handshake".to_string(),
                ));
            }
            Some(Err(e)) => return Err(e.into()),
        };
        match reply.as_str() {
            REPLY_OK => {}
            REPLY_UNAUTHORIZED => return Ok(SessionEnd::Unauthorized),
            REPLY_FORBIDDEN => return Ok(SessionEnd::Forbidden),
            other => {
                return Err(AgentError::Protocol(format!(
                    "unexpected handshake reply '{}'",
                    other
                )));
            }
        }
        info!(uid = %self.config.uid, "control channel established");

        while let Some(frame) = ws.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "control channel read failed");
                    break;
                }
            };
            let request: RpcRequest = match serde_json::from_str(&text) {
                Ok(request) => request,
                Err(e) => {
                    debug!(error = %e, "dropping unparseable control frame");
                    continue;
                }
            };
            let response = self.handle_request(request).await;
            if ws
                .send(Message::Text(serde_json::to_string(&response)?))
                .await
                .is_err()
            {
                break;
            }
        }
        Ok(SessionEnd::Closed)
    }

    /// Answer one JSON-RPC call from the server.
    pub async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        let params: Vec<Value> = match request.params {
            Value::Array(params) => params,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        match request.method.as_str() {
            "get_keyword_names" => {
                RpcResponse::result(id, serde_json::json!(self.library.keyword_names()))
            }
            "run_keyword" => {
                let Some(name) = params.first().and_then(Value::as_str).map(str::to_string)
                else {
                    return RpcResponse::error(id, -32602, "run_keyword needs a keyword name");
                };
                let args = match params.get(1) {
                    Some(Value::Array(args)) => args.clone(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => vec![other.clone()],
                };
                let kwargs = params.get(2).cloned().unwrap_or(Value::Null);
                let result = self.library.run_keyword(&name, args, kwargs).await;
                match serde_json::to_value(&result) {
                    Ok(value) => RpcResponse::result(id, value),
                    Err(e) => RpcResponse::error(id, -32603, e.to_string()),
                }
            }
            "get_keyword_arguments" => match params.first().and_then(Value::as_str) {
                Some(name) => {
                    RpcResponse::result(id, serde_json::json!(self.library.keyword_arguments(name)))
                }
                None => RpcResponse::error(id, -32602, "keyword name required"),
            },
            "get_keyword_documentation" => match params.first().and_then(Value::as_str) {
                Some(name) => RpcResponse::result(
                    id,
                    Value::String(self.library.keyword_documentation(name)),
                ),
                None => RpcResponse::error(id, -32602, "keyword name required"),
            },
            "get_keyword_tags" => match params.first().and_then(Value::as_str) {
                Some(name) => {
                    RpcResponse::result(id, serde_json::json!(self.library.keyword_tags(name)))
                }
                None => RpcResponse::error(id, -32602, "keyword name required"),
            },
            "get_endpoint_config" => RpcResponse::result(id, self.config_info.clone()),
            other => RpcResponse::error(id, -32601, format!("method '{}' not found", other)),
        }
    }

    /// Open the message channel and hand back a streaming handle. The
    /// writer task dies with the handle.
    pub async fn open_message_channel(&self) -> Result<MessageChannel, AgentError> {
        let url = format!("{}/msg", self.config.server_url);
        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut sink, _stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<StreamFrame>(64);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });
        Ok(MessageChannel { tx })
    }
}

/// Push-only handle on the message channel.
#[derive(Clone)]
pub struct MessageChannel {
    tx: mpsc::Sender<StreamFrame>,
}

impl MessageChannel {
    /// Stream one chunk of output for a task. An empty task id marks a
    /// daemon-level message.
    pub async fn send(&self, task_id: &str, data: &str) -> Result<(), AgentError> {
        self.tx
            .send(StreamFrame {
                task_id: task_id.to_string(),
                data: data.to_string(),
            })
            .await
            .map_err(|_| AgentError::Protocol("message channel closed".to_string()))
    }

    /// Whether the underlying socket writer is still alive.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::testing::EchoLibrary;

    fn agent() -> Agent {
        Agent::new(
            AgentConfig::new(
                "ws://127.0.0.1:5000",
                "org-1",
                "7e7cc102-3d46-43a6-9f4b-2d2f0600a793",
            ),
            Arc::new(EchoLibrary),
        )
    }

    #[tokio::test]
    async fn test_get_keyword_names() {
        let response = agent()
            .handle_request(RpcRequest::new(1, "get_keyword_names", Value::Null))
            .await;
        assert_eq!(response.result.unwrap(), serde_json::json!(["echo"]));
    }

    #[tokio::test]
    async fn test_run_keyword_pass() {
        let response = agent()
            .handle_request(RpcRequest::new(
                2,
                "run_keyword",
                serde_json::json!(["echo", ["a", 1], {}]),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["status"], "PASS");
        assert_eq!(result["return"], serde_json::json!(["a", 1]));
    }

    #[tokio::test]
    async fn test_run_keyword_unknown_is_fail_result() {
        let response = agent()
            .handle_request(RpcRequest::new(
                3,
                "run_keyword",
                serde_json::json!(["nope", [], {}]),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["status"], "FAIL");
    }

    #[tokio::test]
    async fn test_unknown_method_is_rpc_error() {
        let response = agent()
            .handle_request(RpcRequest::new(4, "stop_remote_server", Value::Null))
            .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_endpoint_config_reports_identity() {
        let response = agent()
            .handle_request(RpcRequest::new(5, "get_endpoint_config", Value::Null))
            .await;
        let config = response.result.unwrap();
        assert_eq!(config["join_id"], "org-1");
    }

    #[tokio::test]
    async fn test_run_keyword_without_name_is_invalid_params() {
        let response = agent()
            .handle_request(RpcRequest::new(6, "run_keyword", serde_json::json!([])))
            .await;
        assert_eq!(response.error.unwrap().code, -32602);
    }
}
