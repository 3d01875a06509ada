// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::dequeue::DequeueError;
use crate::workflow::WorkflowError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    /// Logs the cause and hides it from the caller.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        error!(error = %cause, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl From<DequeueError> for ApiError {
    fn from(e: DequeueError) -> Self {
        match e {
            DequeueError::Validation(_) => Self::bad_request(e.to_string()),
            DequeueError::NotFound(_) => Self::not_found(e.to_string()),
            // Handlers render pending jobs as 202 themselves
            DequeueError::Pending { .. } => Self::conflict(e.to_string()),
            DequeueError::Store(_) => Self::internal(e),
        }
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::Validation(_) | WorkflowError::UnknownKind(_) => {
                Self::bad_request(e.to_string())
            }
            WorkflowError::DuplicateName(_) => Self::conflict(e.to_string()),
            WorkflowError::NotFound(_) => Self::not_found(e.to_string()),
            WorkflowError::Store(_) => Self::internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    use crate::storage::StoreError;

    #[test]
    fn dequeue_errors_map_to_status() {
        let bad = ApiError::from(DequeueError::Validation("no method".into()));
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        assert_eq!(bad.message, "invalid job: no method");

        assert_eq!(
            ApiError::from(DequeueError::NotFound(4)).status,
            StatusCode::NOT_FOUND
        );

        let store = ApiError::from(DequeueError::Store(StoreError::Conflict("x".into())));
        assert_eq!(store.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store.message, "internal error");
    }

    #[test]
    fn workflow_errors_map_to_status() {
        assert_eq!(
            ApiError::from(WorkflowError::DuplicateName("sync".into())).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(WorkflowError::UnknownKind("nope".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(WorkflowError::NotFound(1)).status,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data"}"#);
    }
}
