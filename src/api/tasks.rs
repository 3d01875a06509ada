// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::error::ApiError;
use crate::models::TaskRecord;
use crate::state::AppState;

/// A task row plus the numeric code of its state.
#[derive(Debug, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub code: u8,
}

impl From<TaskRecord> for TaskView {
    fn from(task: TaskRecord) -> Self {
        let code = task.state.code();
        Self { task, code }
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<u64>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.workflow.task(task_id)?.into()))
}
