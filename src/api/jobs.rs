// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::dequeue::DequeueError;
use crate::error::ApiError;
use crate::models::{JobStatus, NewJob};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct JobCreated {
    pub id: u64,
}

/// Body returned while a job has not reached a terminal status.
#[derive(Debug, Serialize)]
pub struct JobPending {
    pub id: u64,
    pub status: JobStatus,
    pub code: u8,
}

/// Enqueue a transaction job.
///
/// Returns once the row is persisted; submission continues in the
/// background on the worker that owns the account.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<NewJob>,
) -> Result<(StatusCode, Json<JobCreated>), ApiError> {
    let id = state.dequeue.enqueue(request)?;
    Ok((StatusCode::CREATED, Json(JobCreated { id })))
}

/// Outcome of a job: 200 when terminal, 202 while still pending.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<u64>,
) -> Result<Response, ApiError> {
    match state.dequeue.review(job_id) {
        Ok(review) => Ok((StatusCode::OK, Json(review)).into_response()),
        Err(DequeueError::Pending { id, status }) => Ok((
            StatusCode::ACCEPTED,
            Json(JobPending {
                id,
                status,
                code: status.code(),
            }),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}
