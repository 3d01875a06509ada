// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Process-local message bus for status and completion notifications.
//!
//! Publishing is fire-and-forget: events sent while nobody is subscribed are
//! dropped, and slow subscribers may observe `Lagged`.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{JobStatus, TaskState};

/// Default number of buffered events per subscriber.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A supervised watcher's health flag flipped
    WatcherStatusChanged { watcher: String, healthy: bool },
    /// A transaction job reached a terminal status
    JobFinalized { job_id: u64, status: JobStatus },
    /// A workflow task reached Done or Failed
    TaskCompleted { task_id: u64, state: TaskState },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WatcherStatusChanged { .. } => "watcher_status_changed",
            Self::JobFinalized { .. } => "job_finalized",
            Self::TaskCompleted { .. } => "task_completed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        tracing::debug!(event = event.name(), payload = ?event, "Publishing event");
        // No receivers is not an error for a best-effort bus
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::TaskCompleted {
            task_id: 7,
            state: TaskState::Done,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            Event::TaskCompleted {
                task_id: 7,
                state: TaskState::Done
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(Event::JobFinalized {
            job_id: 1,
            status: JobStatus::Confirmed,
        });
    }

    #[test]
    fn events_serialize_with_name_tag() {
        let json = serde_json::to_value(Event::WatcherStatusChanged {
            watcher: "recovery".into(),
            healthy: false,
        })
        .unwrap();
        assert_eq!(json["event"], "watcher_status_changed");
        assert_eq!(json["healthy"], false);
    }
}
