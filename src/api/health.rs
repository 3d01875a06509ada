// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::supervisor::WatcherStatus;

/// Health check response with per-watcher status.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall health status ("ok" or "degraded").
    pub status: String,
    pub worker: WorkerInfo,
    pub watchers: Vec<WatcherStatus>,
}

/// Position of this process in the fleet.
#[derive(Debug, Serialize)]
pub struct WorkerInfo {
    pub index: u64,
    pub count: u64,
}

/// Health check endpoint handler.
///
/// Returns 200 if every watcher last reported healthy, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let watchers = state.supervisor.statuses();
    let all_ok = watchers.iter().all(|w| w.healthy);
    let shards = state.dequeue.shards();

    let response = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        worker: WorkerInfo {
            index: shards.index,
            count: shards.count,
        },
        watchers,
    };

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}
