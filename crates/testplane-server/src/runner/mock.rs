// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Emits a scripted output line sequence and exit code without spawning a
//! real process. `never_exit` keeps the fake child alive until terminated,
//! which is what the cancellation tests need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use super::traits::{LaunchSpec, Result, Runner, RunningTest, TestProcess};

/// Exit code reported when the fake child is terminated.
pub const TERMINATED_EXIT_CODE: i32 = 143;

struct MockProcess {
    terminated: AtomicBool,
    notify: Notify,
}

impl TestProcess for MockProcess {
    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Scripted runner for tests.
pub struct MockRunner {
    /// Lines emitted as output chunks (newline appended).
    pub output: Vec<String>,
    /// Exit code when the script completes.
    pub exit_code: i32,
    /// Delay between emitted lines (milliseconds).
    pub line_delay_ms: u64,
    /// Keep the fake child alive after the script until terminated.
    pub never_exit: bool,
    launches: Mutex<Vec<LaunchSpec>>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Runner that prints one line and exits 0.
    pub fn new() -> Self {
        Self {
            output: vec!["test output".to_string()],
            exit_code: 0,
            line_delay_ms: 0,
            never_exit: false,
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Runner whose fake child exits with the given code.
    pub fn exiting_with(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::new()
        }
    }

    /// Runner whose fake child runs until terminated.
    pub fn never_exiting() -> Self {
        Self {
            never_exit: true,
            ..Self::new()
        }
    }

    /// Replace the scripted output lines.
    pub fn with_output(mut self, lines: Vec<String>) -> Self {
        self.output = lines;
        self
    }

    /// Delay each emitted line by the given milliseconds.
    pub fn with_line_delay(mut self, delay_ms: u64) -> Self {
        self.line_delay_ms = delay_ms;
        self
    }

    /// Every launch spec this runner has seen.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().expect("launch log poisoned").clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<RunningTest> {
        self.launches
            .lock()
            .expect("launch log poisoned")
            .push(spec.clone());

        let process = Arc::new(MockProcess {
            terminated: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let (tx, output) = mpsc::channel(64);
        let (exit_tx, exit) = tokio::sync::oneshot::channel();

        let lines = self.output.clone();
        let exit_code = self.exit_code;
        let line_delay = Duration::from_millis(self.line_delay_ms);
        let never_exit = self.never_exit;
        let child = process.clone();

        tokio::spawn(async move {
            let mut code = exit_code;
            for line in lines {
                if child.terminated.load(Ordering::SeqCst) {
                    code = TERMINATED_EXIT_CODE;
                    break;
                }
                if !line_delay.is_zero() {
                    tokio::time::sleep(line_delay).await;
                }
                if tx.send(format!("{}\n", line).into_bytes()).await.is_err() {
                    break;
                }
            }
            if never_exit && !child.terminated.load(Ordering::SeqCst) {
                child.notify.notified().await;
                code = TERMINATED_EXIT_CODE;
            } else if child.terminated.load(Ordering::SeqCst) {
                code = TERMINATED_EXIT_CODE;
            }
            drop(tx);
            let _ = exit_tx.send(code);
        });

        Ok(RunningTest {
            output,
            exit,
            process,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            program: "robot".to_string(),
            args: vec!["suite.md".to_string()],
            cwd: None,
            task_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_scripted_output_and_exit() {
        let runner = MockRunner {
            output: vec!["line 1".to_string(), "line 2".to_string()],
            ..MockRunner::new()
        };
        let mut running = runner.launch(&spec()).await.unwrap();

        let mut text = String::new();
        while let Some(chunk) = running.output.recv().await {
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert_eq!(text, "line 1\nline 2\n");
        assert_eq!(running.exit.await.unwrap(), 0);
        assert_eq!(runner.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_never_exiting_until_terminated() {
        let runner = MockRunner::never_exiting();
        let mut running = runner.launch(&spec()).await.unwrap();

        // One scripted line arrives, then the fake child hangs.
        assert!(running.output.recv().await.is_some());
        running.process.terminate();
        while running.output.recv().await.is_some() {}
        assert_eq!(running.exit.await.unwrap(), TERMINATED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_failure_exit_code() {
        let runner = MockRunner::exiting_with(2);
        let mut running = runner.launch(&spec()).await.unwrap();
        while running.output.recv().await.is_some() {}
        assert_eq!(running.exit.await.unwrap(), 2);
    }
}
