// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! A runner launches one test-runner child per claimed task and hands back
//! its merged output stream, its exit future and a terminate handle. Runners
//! are pure execution engines: they never touch the store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The runner executable could not be started.
    #[error("Failed to launch test runner: {0}")]
    Spawn(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Command line of one test run.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable to spawn.
    pub program: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// Working directory, or the server's own when `None`.
    pub cwd: Option<PathBuf>,
    /// Task the child belongs to.
    pub task_id: Uuid,
}

/// Handle for terminating a launched child.
pub trait TestProcess: Send + Sync {
    /// Ask the child to stop (SIGTERM-level). Idempotent.
    fn terminate(&self);

    /// OS process id, when one exists.
    fn pid(&self) -> Option<u32>;
}

/// A launched test run.
pub struct RunningTest {
    /// Merged stdout+stderr byte chunks. Closed when both pipes drain.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Exit code; `-1` when unavailable (signal death).
    pub exit: oneshot::Receiver<i32>,
    /// Terminate handle, registered in the process table.
    pub process: Arc<dyn TestProcess>,
}

/// Trait for test execution backends.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runner type identifier (e.g. "process", "mock").
    fn runner_type(&self) -> &'static str;

    /// Launch a test child and return its handles without waiting for it.
    async fn launch(&self, spec: &LaunchSpec) -> Result<RunningTest>;
}
