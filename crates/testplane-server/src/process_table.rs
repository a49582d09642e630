// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process table: task id -> terminate handle of the running child.
//!
//! Only the task loop of the owning endpoint registers and deregisters; the
//! CANCEL_TASK handler terminates through it. The narrow interface keeps
//! every other caller away from raw child handles.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::runner::TestProcess;

/// Shared table of running test children.
#[derive(Default)]
pub struct ProcessTable {
    processes: DashMap<Uuid, Arc<dyn TestProcess>>,
}

impl ProcessTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a launched child under its task id.
    pub fn register(&self, task_id: Uuid, process: Arc<dyn TestProcess>) {
        self.processes.insert(task_id, process);
    }

    /// Stop tracking a child. Called by the task loop when it exits.
    pub fn deregister(&self, task_id: Uuid) {
        self.processes.remove(&task_id);
    }

    /// Terminate the child of a task. Returns whether a child was found;
    /// the entry stays registered, the task loop removes it on exit.
    pub fn terminate(&self, task_id: Uuid) -> bool {
        match self.processes.get(&task_id) {
            Some(process) => {
                process.terminate();
                true
            }
            None => false,
        }
    }

    /// Whether a child is registered for the task.
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.processes.contains_key(&task_id)
    }

    /// Number of tracked children.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether no children are tracked.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeProcess {
        terminated: AtomicBool,
    }

    impl TestProcess for FakeProcess {
        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }

        fn pid(&self) -> Option<u32> {
            None
        }
    }

    #[test]
    fn test_register_terminate_deregister() {
        let table = ProcessTable::new();
        let task_id = Uuid::new_v4();
        let process = Arc::new(FakeProcess {
            terminated: AtomicBool::new(false),
        });
        table.register(task_id, process.clone());

        assert!(table.contains(task_id));
        assert!(table.terminate(task_id));
        assert!(process.terminated.load(Ordering::SeqCst));
        // Terminate leaves the entry; the task loop deregisters on exit.
        assert!(table.contains(task_id));

        table.deregister(task_id);
        assert!(!table.contains(task_id));
        assert!(!table.terminate(task_id));
    }
}
