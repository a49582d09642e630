// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Testplane Agent - Worker-Side Connector
//!
//! The agent is the peer the server's proxy hub expects on a worker host:
//! it holds two websockets against the server, serves user-defined keywords
//! over the control channel's JSON-RPC, and streams test output over the
//! message channel. After a server-initiated close it reconnects with a
//! linear backoff under the same uid; the server never re-opens a socket.
//!
//! ```text
//!  worker host                         server
//! ┌─────────────────┐   ws /rpc   ┌──────────────┐
//! │ Agent ──────────┼────────────►│  proxy slot  │
//! │   KeywordLibrary│◄────────────┼ JSON-RPC     │
//! │                 │   ws /msg   │              │
//! │ MessageChannel ─┼────────────►│  fan-out     │
//! └─────────────────┘ {task_id,…} └──────────────┘
//! ```

/// The connector and its configuration.
pub mod agent;

/// Keyword library trait.
pub mod library;

pub use agent::{Agent, AgentConfig, AgentError, MessageChannel, SessionEnd};
pub use library::KeywordLibrary;
