// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live log fan-out.
//!
//! Browser sockets subscribe to per-(organization, team) rooms and receive
//! `task started`, `test report`, `test log` and `task finished` events.
//! Console output is additionally accumulated per (room, task) so a late
//! subscriber can be brought up to date with one `backlog` event; buffers
//! are freed when the task reaches a terminal state.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// `task started` event name.
pub const EVENT_TASK_STARTED: &str = "task started";
/// `test report` (streamed console output) event name.
pub const EVENT_TEST_REPORT: &str = "test report";
/// `test log` (structured harness messages) event name.
pub const EVENT_TEST_LOG: &str = "test log";
/// `backlog` (replay on join) event name.
pub const EVENT_BACKLOG: &str = "backlog";
/// `task finished` event name.
pub const EVENT_TASK_FINISHED: &str = "task finished";

/// Room identifier: `"{organization}:{team-or-empty}"`.
pub fn room_id(organization: &str, team: Option<&str>) -> String {
    format!("{}:{}", organization, team.unwrap_or(""))
}

/// One event frame pushed to browser subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    /// Event name.
    pub event: String,
    /// Event payload.
    pub data: serde_json::Value,
}

type Subscriber = (u64, mpsc::UnboundedSender<OutboundFrame>);

/// Fan-out hub: subscribers and backlog buffers per room.
#[derive(Default)]
pub struct RoomHub {
    subscribers: DashMap<String, Vec<Subscriber>>,
    backlog: DashMap<(String, String), String>,
    next_id: AtomicU64,
}

impl RoomHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room. Returns the subscriber id (for [`Self::unsubscribe`])
    /// and the event receiver.
    pub fn subscribe(&self, room: &str) -> (u64, mpsc::UnboundedReceiver<OutboundFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(room.to_string())
            .or_default()
            .push((id, tx));
        debug!(room, subscriber = id, "room joined");
        (id, rx)
    }

    /// Leave a room.
    pub fn unsubscribe(&self, room: &str, id: u64) {
        if let Some(mut subscribers) = self.subscribers.get_mut(room) {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Push one event to every subscriber of a room. Dead subscribers are
    /// pruned on the way.
    pub fn emit(&self, room: &str, event: &str, data: serde_json::Value) {
        let Some(mut subscribers) = self.subscribers.get_mut(room) else {
            return;
        };
        let frame = OutboundFrame {
            event: event.to_string(),
            data,
        };
        subscribers.retain(|(_, tx)| tx.send(frame.clone()).is_ok());
    }

    /// Append one console chunk to the replay buffer of (room, task).
    pub fn append_backlog(&self, room: &str, task_id: &str, chunk: &str) {
        self.backlog
            .entry((room.to_string(), task_id.to_string()))
            .or_default()
            .push_str(chunk);
    }

    /// Full replay buffer of (room, task), if one exists.
    pub fn backlog(&self, room: &str, task_id: &str) -> Option<String> {
        self.backlog
            .get(&(room.to_string(), task_id.to_string()))
            .map(|buffer| buffer.clone())
    }

    /// Drop the replay buffer of (room, task). Called when the task goes
    /// terminal.
    pub fn free_backlog(&self, room: &str, task_id: &str) {
        self.backlog
            .remove(&(room.to_string(), task_id.to_string()));
    }

    /// Number of live subscribers in a room.
    pub fn subscriber_count(&self, room: &str) -> usize {
        self.subscribers
            .get(room)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_format() {
        assert_eq!(room_id("org-1", Some("team-a")), "org-1:team-a");
        assert_eq!(room_id("org-1", None), "org-1:");
    }

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers_in_order() {
        let hub = RoomHub::new();
        let (_, mut rx1) = hub.subscribe("org-1:");
        let (_, mut rx2) = hub.subscribe("org-1:");

        hub.emit("org-1:", EVENT_TASK_STARTED, serde_json::json!({"task_id": "t1"}));
        hub.emit(
            "org-1:",
            EVENT_TEST_REPORT,
            serde_json::json!({"task_id": "t1", "message": "hello"}),
        );

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().event, EVENT_TASK_STARTED);
            assert_eq!(rx.recv().await.unwrap().event, EVENT_TEST_REPORT);
        }
    }

    #[tokio::test]
    async fn test_emit_does_not_cross_rooms() {
        let hub = RoomHub::new();
        let (_, mut rx_a) = hub.subscribe("org-a:");
        let (_, mut rx_b) = hub.subscribe("org-b:");

        hub.emit("org-a:", EVENT_TASK_STARTED, serde_json::json!({}));
        assert_eq!(rx_a.recv().await.unwrap().event, EVENT_TASK_STARTED);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = RoomHub::new();
        let (id, mut rx) = hub.subscribe("org-1:");
        hub.unsubscribe("org-1:", id);
        hub.emit("org-1:", EVENT_TASK_STARTED, serde_json::json!({}));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count("org-1:"), 0);
    }

    #[test]
    fn test_backlog_accumulates_and_frees() {
        let hub = RoomHub::new();
        hub.append_backlog("org-1:", "t1", "one ");
        hub.append_backlog("org-1:", "t1", "two");
        assert_eq!(hub.backlog("org-1:", "t1").unwrap(), "one two");

        hub.free_backlog("org-1:", "t1");
        assert!(hub.backlog("org-1:", "t1").is_none());
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_pruned() {
        let hub = RoomHub::new();
        let (_, rx) = hub.subscribe("org-1:");
        drop(rx);
        hub.emit("org-1:", EVENT_TASK_STARTED, serde_json::json!({}));
        assert_eq!(hub.subscriber_count("org-1:"), 0);
    }
}
