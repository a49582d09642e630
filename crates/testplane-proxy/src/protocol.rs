// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire protocol for the endpoint channels.
//!
//! An endpoint holds two websockets against the server:
//!
//! - the **control channel** (`/rpc`): one JSON handshake, a literal
//!   text reply (`"OK"`, `"Unauthorized"`, `"Forbidden"`), then JSON-RPC 2.0
//!   frames with the server as caller and the endpoint as callee;
//! - the **message channel** (`/msg`): push-only `{task_id, data}` frames
//!   from the endpoint, relayed to browser rooms.
//!
//! The split is deliberate: stdout streaming must not be blocked behind a
//! long-running keyword call.

use serde::{Deserialize, Serialize};

/// Handshake reply: endpoint is allowed to stay.
pub const REPLY_OK: &str = "OK";
/// Handshake reply: endpoint is not authorized yet.
pub const REPLY_UNAUTHORIZED: &str = "Unauthorized";
/// Handshake reply: endpoint is blacklisted.
pub const REPLY_FORBIDDEN: &str = "Forbidden";

/// The five keyword methods an endpoint serves over the control channel.
pub const KEYWORD_METHODS: [&str; 5] = [
    "get_keyword_names",
    "run_keyword",
    "get_keyword_arguments",
    "get_keyword_documentation",
    "get_keyword_tags",
];

/// First client frame on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Organization (or team) identifier the endpoint joins.
    pub join_id: String,
    /// Endpoint uid, server-assigned, stable across reconnects.
    pub uid: String,
    /// Server-side script file backing this endpoint's keywords. Empty for
    /// the daemon-level connection.
    #[serde(default)]
    pub backing_file: String,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// JSON-RPC request, server -> endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version marker.
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Request id from the slot's monotonic counter.
    pub id: u64,
    /// Method name, one of [`KEYWORD_METHODS`].
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RpcRequest {
    /// Build a request frame.
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// JSON-RPC response, endpoint -> server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version marker.
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Id of the request this answers.
    pub id: u64,
    /// Result value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error object on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Successful response.
    pub fn result(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Message-channel frame: one chunk of live output for a task. An empty
/// `task_id` marks a daemon-level message, which the fan-out discards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Task the chunk belongs to, or empty.
    #[serde(default)]
    pub task_id: String,
    /// Raw output data.
    #[serde(default)]
    pub data: String,
}

/// Outcome of `run_keyword` on the worker side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeywordStatus {
    /// Keyword passed.
    #[serde(rename = "PASS")]
    Pass,
    /// Keyword failed.
    #[serde(rename = "FAIL")]
    Fail,
}

/// `run_keyword` return object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordResult {
    /// Pass/fail.
    pub status: KeywordStatus,
    /// Keyword return value.
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker-side traceback on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Captured keyword output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Whether the failure lets the test continue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuable: Option<bool>,
    /// Whether the failure aborts the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<bool>,
}

impl KeywordResult {
    /// Passing result with a return value.
    pub fn pass(return_value: serde_json::Value) -> Self {
        Self {
            status: KeywordStatus::Pass,
            return_value: Some(return_value),
            error: None,
            traceback: None,
            output: None,
            continuable: None,
            fatal: None,
        }
    }

    /// Failing result carrying an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: KeywordStatus::Fail,
            return_value: None,
            error: Some(error.into()),
            traceback: None,
            output: None,
            continuable: None,
            fatal: None,
        }
    }
}

/// Normalize a `(uid, backing_file)` pair into the slot key.
///
/// The daemon-level connection registers with an empty backing file and
/// keys the slot by the bare uid.
pub fn proxy_path(uid: &str, backing_file: &str) -> String {
    let uid = uid.trim_matches('/');
    let backing_file = backing_file.trim_matches('/');
    if backing_file.is_empty() {
        uid.to_string()
    } else {
        format!("{}/{}", uid, backing_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_path_normalization() {
        assert_eq!(proxy_path("abc", ""), "abc");
        assert_eq!(proxy_path("abc", "lib.py"), "abc/lib.py");
        assert_eq!(proxy_path("/abc/", "/lib.py/"), "abc/lib.py");
    }

    #[test]
    fn test_handshake_roundtrip() {
        let json = r#"{"join_id":"org-1","uid":"u-1","backing_file":"lib.py"}"#;
        let handshake: Handshake = serde_json::from_str(json).unwrap();
        assert_eq!(handshake.join_id, "org-1");
        assert_eq!(handshake.backing_file, "lib.py");

        // backing_file may be omitted by daemon-level connections
        let handshake: Handshake =
            serde_json::from_str(r#"{"join_id":"org-1","uid":"u-1"}"#).unwrap();
        assert_eq!(handshake.backing_file, "");
    }

    #[test]
    fn test_keyword_result_wire_shape() {
        let pass = KeywordResult::pass(serde_json::json!(42));
        let json = serde_json::to_value(&pass).unwrap();
        assert_eq!(json["status"], "PASS");
        assert_eq!(json["return"], 42);
        assert!(json.get("error").is_none());

        let fail = KeywordResult::fail("boom");
        let json = serde_json::to_value(&fail).unwrap();
        assert_eq!(json["status"], "FAIL");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_rpc_frames_roundtrip() {
        let request = RpcRequest::new(7, "run_keyword", serde_json::json!(["ping", [], {}]));
        let parsed: RpcRequest =
            serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.method, "run_keyword");

        let response = RpcResponse::error(7, -32000, "endpoint gone");
        let parsed: RpcResponse =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.error.unwrap().message, "endpoint gone");
    }
}
