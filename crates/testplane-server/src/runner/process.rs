// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child-process runner.
//!
//! Spawns the configured test-runner executable with stdout and stderr both
//! piped; two reader tasks merge them into one chunk stream, preserving the
//! combined-output contract of the task loop. Termination is SIGTERM so the
//! runner can emit its teardown output before exiting.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::traits::{LaunchSpec, Result, Runner, RunnerError, RunningTest, TestProcess};

const READ_CHUNK: usize = 4096;

/// Runner executing tests as local child processes.
#[derive(Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// New process runner.
    pub fn new() -> Self {
        Self
    }
}

struct ProcessHandle {
    pid: Option<u32>,
}

impl TestProcess for ProcessHandle {
    fn terminate(&self) {
        let Some(pid) = self.pid else {
            warn!("terminate requested for a child without a pid");
            return;
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => debug!(pid, "sent SIGTERM to test runner"),
            Err(nix::errno::Errno::ESRCH) => debug!(pid, "test runner already gone"),
            Err(e) => warn!(pid, error = %e, "failed to signal test runner"),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<RunningTest> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {}", spec.program, e)))?;
        let pid = child.id();
        debug!(task_id = %spec.task_id, pid = ?pid, program = %spec.program, "test runner spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, output) = mpsc::channel(64);
        let stdout_task = stdout.map(|out| tokio::spawn(pump(out, tx.clone())));
        let stderr_task = stderr.map(|err| tokio::spawn(pump(err, tx.clone())));
        drop(tx);

        let (exit_tx, exit) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(error = %e, "waiting on test runner failed");
                    -1
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(RunningTest {
            output,
            exit,
            process: Arc::new(ProcessHandle { pid }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            task_id: Uuid::new_v4(),
        }
    }

    async fn drain(mut running: RunningTest) -> (String, i32) {
        let mut collected = Vec::new();
        while let Some(chunk) = running.output.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let code = running.exit.await.unwrap_or(-1);
        (String::from_utf8_lossy(&collected).into_owned(), code)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let runner = ProcessRunner::new();
        let running = runner.launch(&spec("sh", &["-c", "echo out"])).await.unwrap();
        let (output, code) = drain(running).await;
        assert!(output.contains("out"));
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_merges_stderr_and_reports_failure() {
        let runner = ProcessRunner::new();
        let running = runner
            .launch(&spec("sh", &["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        let (output, code) = drain(running).await;
        assert!(output.contains("oops"));
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let runner = ProcessRunner::new();
        let result = runner.launch(&spec("definitely-not-a-binary", &[])).await;
        assert!(matches!(result, Err(RunnerError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_child() {
        let runner = ProcessRunner::new();
        let running = runner
            .launch(&spec("sh", &["-c", "sleep 30"]))
            .await
            .unwrap();
        let process = running.process.clone();
        assert!(process.pid().is_some());

        process.terminate();
        let (_, code) = drain(running).await;
        assert_ne!(code, 0);
    }
}
