// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Step descriptors and workflow definitions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

/// Inputs handed to a step body or verify gate.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: u64,
    pub name: String,
    pub args: Value,
    /// Data passed to `next()`, or the task's stored data when none was given
    pub data: Value,
    /// 1-based position of the step in its workflow
    pub step: u32,
}

pub type ExecuteFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
pub type VerifyFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

/// One step: a body, an optional gate checked before the following step
/// starts, and an optional deadline.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub(crate) execute: ExecuteFn,
    pub(crate) verify: Option<VerifyFn>,
    pub timeout: Option<Duration>,
}

impl Step {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |ctx| execute(ctx).boxed()),
            verify: None,
            timeout: None,
        }
    }

    /// Gate evaluated by the `next()` call after this step. `Ok(false)`
    /// stalls the task, `Err` fails it.
    pub fn verify<F, Fut>(mut self, verify: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, String>> + Send + 'static,
    {
        self.verify = Some(Arc::new(move |ctx| verify(ctx).boxed()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Unix-millis deadline for a step starting at `now_ms`, `0` for none.
    pub(crate) fn deadline(&self, now_ms: i64) -> i64 {
        match self.timeout {
            Some(timeout) => {
                let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
                now_ms.saturating_add(millis)
            }
            None => 0,
        }
    }
}

/// An ordered list of steps registered under a kind.
#[derive(Clone)]
pub struct Workflow {
    pub kind: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
