// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Testplane Proxy - RPC Reverse-Proxy Layer
//!
//! An endpoint keeps two websockets open against the server: a control
//! channel carrying bidirectional JSON-RPC (server as caller) and a
//! push-only message channel streaming live output. This crate provides the
//! pieces the server composes around those sockets:
//!
//! - [`protocol`]: the wire frames for both channels and the keyword result
//!   object,
//! - [`slot`]: per-connection proxy slots with pending-call tables, and the
//!   registry keyed by `uid[/backing_file]`,
//! - [`xmlrpc`]: the minimal XML-RPC codec the local facade speaks,
//! - [`facade`]: the local XML-RPC server (port 8270) that forwards each
//!   call from a test-runner child process through the matching slot.
//!
//! ```text
//! test runner ──XML-RPC──► facade ──slot.call()──► control channel ──► endpoint
//!                 (8270)              pending table        (ws /rpc)
//! ```

/// Local XML-RPC facade server.
pub mod facade;

/// Wire frames for the control and message channels.
pub mod protocol;

/// Proxy slots and the slot registry.
pub mod slot;

/// XML-RPC codec.
pub mod xmlrpc;

pub use protocol::{
    Handshake, KEYWORD_METHODS, KeywordResult, KeywordStatus, REPLY_FORBIDDEN, REPLY_OK,
    REPLY_UNAUTHORIZED, RpcErrorObject, RpcRequest, RpcResponse, StreamFrame, proxy_path,
};
pub use slot::{ProxyError, ProxyRegistry, ProxySlot};
