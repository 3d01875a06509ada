// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Periodic Supervisor
//!
//! A fixed-interval ticker driving every registered [`Watcher`]. The dequeue
//! recovery scan and the workflow timeout scan both run through here instead
//! of owning their own timers.
//!
//! On tick `n`, a watcher with cadence `c` is due when `n % c == 0`. A due
//! watcher that is still inside a previous `check()` is skipped for that
//! tick. When `check()` returns a health flag different from the last one
//! observed, a [`Event::WatcherStatusChanged`] is published. Watchers start
//! out healthy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};

/// A component with a periodic health/maintenance hook.
#[async_trait]
pub trait Watcher: Send + Sync {
    fn name(&self) -> &str;

    /// Number of supervisor ticks between checks.
    fn cadence(&self) -> u64 {
        1
    }

    /// Run one maintenance pass and report health.
    async fn check(&self) -> bool;
}

struct Entry {
    watcher: Arc<dyn Watcher>,
    busy: AtomicBool,
    healthy: AtomicBool,
}

/// Clears the busy flag when the check finishes, including on panic.
struct BusyGuard(Arc<Entry>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Snapshot of one watcher for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatcherStatus {
    pub name: String,
    pub healthy: bool,
    pub busy: bool,
}

pub struct Supervisor {
    interval: Duration,
    entries: RwLock<Vec<Arc<Entry>>>,
    ticks: AtomicU64,
    events: EventBus,
}

impl Supervisor {
    pub fn new(interval: Duration, events: EventBus) -> Self {
        Self {
            interval,
            entries: RwLock::new(Vec::new()),
            ticks: AtomicU64::new(0),
            events,
        }
    }

    pub fn register(&self, watcher: Arc<dyn Watcher>) {
        info!(
            watcher = watcher.name(),
            cadence = watcher.cadence(),
            "Registering watcher"
        );
        let entry = Arc::new(Entry {
            watcher,
            busy: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        });
        match self.entries.write() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    fn entries(&self) -> Vec<Arc<Entry>> {
        match self.entries.read() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Advance one tick and start every due, idle watcher.
    ///
    /// Returns the handles of the checks started by this tick.
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        let mut started = Vec::new();

        for entry in self.entries() {
            let cadence = entry.watcher.cadence().max(1);
            if tick % cadence != 0 {
                continue;
            }
            if entry
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!(watcher = entry.watcher.name(), tick, "Watcher still busy, skipping");
                continue;
            }

            let events = self.events.clone();
            started.push(tokio::spawn(async move {
                let guard = BusyGuard(entry);
                let entry = &guard.0;
                let healthy = entry.watcher.check().await;
                let previous = entry.healthy.swap(healthy, Ordering::AcqRel);
                if previous != healthy {
                    if healthy {
                        info!(watcher = entry.watcher.name(), "Watcher recovered");
                    } else {
                        warn!(watcher = entry.watcher.name(), "Watcher unhealthy");
                    }
                    events.publish(Event::WatcherStatusChanged {
                        watcher: entry.watcher.name().to_string(),
                        healthy,
                    });
                }
            }));
        }

        started
    }

    /// Tick at the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Supervisor starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.cancelled() => {
                    info!("Supervisor shutting down");
                    return;
                }
            }
        }
    }

    pub fn statuses(&self) -> Vec<WatcherStatus> {
        self.entries()
            .iter()
            .map(|entry| WatcherStatus {
                name: entry.watcher.name().to_string(),
                healthy: entry.healthy.load(Ordering::Acquire),
                busy: entry.busy.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn all_healthy(&self) -> bool {
        self.statuses().iter().all(|s| s.healthy)
    }
}
