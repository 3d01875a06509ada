// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted row types shared by the dequeue and workflow engines.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::SendOptions;

// =============================================================================
// Transaction jobs
// =============================================================================

/// Submission state of a transaction job.
///
/// Only moves forward: `Pending -> InFlight -> {Confirmed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, not yet claimed by any worker
    Pending,
    /// Claimed; may or may not have been broadcast (see `txid`)
    InFlight,
    /// Mined with a successful receipt
    Confirmed,
    /// Reverted on chain, rejected in preflight, or abandoned
    Failed,
}

impl JobStatus {
    /// Numeric code as exposed to API consumers.
    pub fn code(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InFlight => 1,
            Self::Confirmed => 2,
            Self::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// Where to deliver the outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Callback {
    /// POST the outcome as JSON to this URL
    Http { url: String },
    /// Invoke a handler registered under this name in the local process
    Local { handle: String },
}

/// A persisted request to relay one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionJob {
    /// Auto-increment primary key
    pub id: u64,
    /// Signing address; also the shard key
    pub account: String,
    /// Target contract, `None` for a plain value transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    /// Function signature, e.g. `transfer(address,uint256)`
    pub method: String,
    /// JSON array of call arguments
    pub args: serde_json::Value,
    /// Send options; pinned with the resolved nonce and fees at broadcast
    pub opts: SendOptions,
    /// Transaction hash, written once at the broadcast checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    pub status: JobStatus,
    /// When the job was enqueued
    pub time: DateTime<Utc>,
    /// When the job was last claimed
    pub active: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<Callback>,
    /// Receipt summary or error payload once terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TransactionJob {
    /// Build a fresh pending row. The id is assigned on insert.
    pub fn new_pending(request: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            account: request.account,
            contract: request.contract,
            method: request.method,
            args: request.args,
            opts: request.opts,
            txid: None,
            status: JobStatus::Pending,
            time: now,
            active: now,
            callback: request.callback,
            result: None,
        }
    }

    /// Whether the last claim is older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => now - self.active > threshold,
            Err(_) => false,
        }
    }
}

/// Caller-supplied fields of a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub account: String,
    #[serde(default)]
    pub contract: Option<String>,
    pub method: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
    #[serde(default)]
    pub opts: SendOptions,
    #[serde(default)]
    pub callback: Option<Callback>,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

/// Terminal view of a job as returned by `review()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReview {
    pub id: u64,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<&TransactionJob> for JobReview {
    fn from(job: &TransactionJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            txid: job.txid.clone(),
            result: job.result.clone(),
        }
    }
}

// =============================================================================
// Workflow tasks
// =============================================================================

/// Lifecycle of a workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    InProgress,
    Done,
    Failed,
}

impl TaskState {
    pub fn code(self) -> u8 {
        match self {
            Self::InProgress => 0,
            Self::Done => 1,
            Self::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// A persisted multi-step workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: u64,
    /// Registered workflow this task runs
    pub kind: String,
    /// Dedup key: at most one InProgress task per name
    pub name: String,
    pub args: serde_json::Value,
    /// Latest step output, final result, or error payload
    pub data: serde_json::Value,
    /// Number of steps started so far; `0` before the first `next()`
    pub step: u32,
    /// Deadline of the current step in unix millis, `0` for none
    pub step_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub state: TaskState,
    pub time: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(kind: String, name: String, args: serde_json::Value, user: Option<String>) -> Self {
        Self {
            id: 0,
            kind,
            name,
            args,
            data: serde_json::Value::Null,
            step: 0,
            step_time: 0,
            user,
            state: TaskState::InProgress,
            time: Utc::now(),
        }
    }

    /// Whether the current step deadline has passed.
    pub fn is_overdue(&self, now_ms: i64) -> bool {
        self.state == TaskState::InProgress && self.step_time != 0 && self.step_time < now_ms
    }
}
