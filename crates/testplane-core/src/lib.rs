// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Testplane Core - Data Model and Distributed Queues
//!
//! This crate provides the typed records, state machines and queue
//! primitives underneath the testplane control plane. All state lives in a
//! document-style store with two backends (PostgreSQL, in-memory); every
//! coordination-relevant mutation is a single atomic store primitive.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    testplane-server                         │
//! │   (REST surface, event dispatcher, task loops, heartbeat)   │
//! └─────────────────────────────────────────────────────────────┘
//!                │                            │
//!                │ TaskQueue / EventQueue     │ Store trait
//!                ▼                            ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │    queue primitives      │──►│  PostgresStore / MemoryStore │
//! │  (rw_lock, pop, push,    │   │  (compare-and-set, head pop, │
//! │   flush)                 │   │   find-and-modify counters)  │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! # Coordination model
//!
//! | Primitive | Use |
//! |-----------|-----|
//! | `try_lock_queue` | optimistic `rw_lock` compare-and-set |
//! | `pop_queue_head` | head removal + `running_task` assignment, atomic |
//! | `increment_kickedoff` | claim counter, post-increment value decides the race |
//! | `set_task_status_if` | guarded status writes; terminal states absorbing |
//!
//! Lock acquisition retries every 100 ms for up to 5 s before surrendering.
//! `push` never takes the lock; it is a lone atomic append.
//!
//! # State machines
//!
//! Tasks: `waiting → running → {successful | failed | cancelled}`; terminal
//! states never change again. Endpoints: `Unauthorized → {Offline, Forbidden}`
//! by admin action, `Offline ↔ Online` by heartbeat probes only, `Forbidden`
//! terminal until an admin action.

#![deny(missing_docs)]

/// Unified error type with stable error-code strings.
pub mod error;

/// Records and status state machines.
pub mod model;

/// Distributed queue handles (`TaskQueue`, `EventQueue`).
pub mod queue;

/// Store trait and the PostgreSQL / in-memory backends.
pub mod store;

pub use error::{CoreError, Result};
pub use model::{
    EndpointRecord, EndpointStatus, EventCode, EventRecord, EventStatus, PRIORITY_SCAN, Priority,
    QueueKey, TaskQueueRecord, TaskRecord, TaskStatus,
};
pub use queue::{EventQueue, TaskQueue};
pub use store::{MemoryStore, PostgresStore, Store};
