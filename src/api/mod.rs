// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Admin HTTP surface of a worker process.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod health;
pub mod jobs;
pub mod tasks;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/jobs", post(jobs::create_job))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/tasks/{task_id}", get(tasks::get_task))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health::health))
        .with_state(state)
        .nest("/v1", v1_routes)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
