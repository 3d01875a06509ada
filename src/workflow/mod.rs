// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Step-Workflow Engine
//!
//! Runs multi-step business processes whose progress lives in the task
//! table, so any worker can resume a task after a restart.
//!
//! The `step` column counts steps started: `0` before the first `next()`,
//! `k` once step `k` (1-based) has been started. Each `next()` call:
//!
//! 1. fails the task when given an error,
//! 2. evaluates the verify gate of step `k`, if any (`false` stalls, an
//!    error fails the task),
//! 3. moves the cursor from `k` to `k + 1` with a conditional update on
//!    `(id, state = InProgress, step = k)` and runs step `k + 1` only if
//!    that update hit a row,
//! 4. or, past the last step, finalizes the task as Done.
//!
//! Two concurrent `next()` calls on the same state therefore run the step
//! body once. A timeout scan fails tasks whose current step deadline
//! passed.

pub mod step;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventBus};
use crate::models::{TaskRecord, TaskState};
use crate::storage::{Store, StoreError};
use crate::supervisor::Watcher;

pub use step::{Step, StepContext, Workflow};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid workflow: {0}")]
    Validation(String),

    #[error("a task named `{0}` is already in progress")]
    DuplicateName(String),

    #[error("no workflow registered as `{0}`")]
    UnknownKind(String),

    #[error("task {0} not found")]
    NotFound(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one `next()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// This call won the cursor update and ran the step body
    Started { step: u32, output: Value },
    /// The previous step's verify gate is not satisfied yet
    Stalled,
    /// Another caller advanced the task first
    Contended,
    Done,
    Failed,
    /// The task was already terminal
    Finished(TaskState),
}

pub struct WorkflowEngine {
    store: Arc<Store>,
    events: EventBus,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    timeout_cadence: u64,
}

impl WorkflowEngine {
    pub fn new(store: Arc<Store>, events: EventBus, timeout_cadence: u64) -> Self {
        Self {
            store,
            events,
            workflows: RwLock::new(HashMap::new()),
            timeout_cadence,
        }
    }

    pub fn register(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        if workflow.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "workflow `{}` has no steps",
                workflow.kind
            )));
        }
        info!(kind = %workflow.kind, steps = workflow.len(), "Registering workflow");
        let kind = workflow.kind.clone();
        match self.workflows.write() {
            Ok(mut workflows) => workflows.insert(kind, Arc::new(workflow)),
            Err(poisoned) => poisoned.into_inner().insert(kind, Arc::new(workflow)),
        };
        Ok(())
    }

    fn workflow(&self, kind: &str) -> Result<Arc<Workflow>, WorkflowError> {
        let found = match self.workflows.read() {
            Ok(workflows) => workflows.get(kind).cloned(),
            Err(poisoned) => poisoned.into_inner().get(kind).cloned(),
        };
        found.ok_or_else(|| WorkflowError::UnknownKind(kind.to_string()))
    }

    /// Create a task, failing if another task with `name` is in progress.
    pub fn make(
        self: &Arc<Self>,
        kind: &str,
        name: &str,
        args: Value,
        user: Option<String>,
    ) -> Result<TaskHandle, WorkflowError> {
        self.workflow(kind)?;
        if name.trim().is_empty() {
            return Err(WorkflowError::Validation("task name must not be empty".into()));
        }

        let result = self.store.transaction(|txn| {
            let live: Vec<TaskRecord> =
                txn.select(|t: &TaskRecord| t.name == name && t.state == TaskState::InProgress)?;
            if !live.is_empty() {
                return Err(StoreError::Conflict(name.to_string()));
            }
            let mut task = TaskRecord::new(kind.to_string(), name.to_string(), args, user);
            txn.insert(&mut task)?;
            Ok(task)
        });

        let task = match result {
            Ok(task) => task,
            Err(StoreError::Conflict(_)) => return Err(WorkflowError::DuplicateName(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        info!(task_id = task.id, kind, name, "Task created");
        Ok(TaskHandle {
            engine: Arc::clone(self),
            id: task.id,
        })
    }

    pub fn handle(self: &Arc<Self>, id: u64) -> TaskHandle {
        TaskHandle {
            engine: Arc::clone(self),
            id,
        }
    }

    pub fn task(&self, id: u64) -> Result<TaskRecord, WorkflowError> {
        self.store.get(id)?.ok_or(WorkflowError::NotFound(id))
    }

    /// Advance a task by one step.
    pub async fn next(
        &self,
        id: u64,
        input: Result<Option<Value>, String>,
    ) -> Result<Advance, WorkflowError> {
        let data = match input {
            Ok(data) => data,
            Err(message) => {
                let task = self.task(id)?;
                if task.state.is_terminal() {
                    return Ok(Advance::Finished(task.state));
                }
                return self.fail(&task, json!({ "error": message })).await;
            }
        };

        let task = self.task(id)?;
        if task.state.is_terminal() {
            return Ok(Advance::Finished(task.state));
        }
        let workflow = self.workflow(&task.kind)?;
        let current = task.step;
        let ctx = |step: u32| StepContext {
            task_id: task.id,
            name: task.name.clone(),
            args: task.args.clone(),
            data: data.clone().unwrap_or_else(|| task.data.clone()),
            step,
        };

        if current > 0 {
            if let Some(verify) = workflow
                .steps
                .get(current as usize - 1)
                .and_then(|s| s.verify.clone())
            {
                match verify(ctx(current)).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(task_id = id, step = current, "Verify gate not satisfied");
                        return Ok(Advance::Stalled);
                    }
                    Err(message) => {
                        info!(task_id = id, step = current, error = %message, "Verify gate failed");
                        return self
                            .fail(&task, json!({ "error": message, "step": current }))
                            .await;
                    }
                }
            }
        }

        let Some(step) = workflow.steps.get(current as usize) else {
            return self.complete(&task, data.clone()).await;
        };

        let next = current + 1;
        let deadline = step.deadline(Utc::now().timestamp_millis());
        let affected = self.store.update::<TaskRecord, _, _>(
            id,
            |row| row.state == TaskState::InProgress && row.step == current,
            {
                let data = data.clone();
                move |row| {
                    row.step = next;
                    row.step_time = deadline;
                    if let Some(data) = data {
                        row.data = data;
                    }
                }
            },
        )?;
        if affected == 0 {
            debug!(task_id = id, step = current, "Step already advanced by another caller");
            return Ok(Advance::Contended);
        }
        debug!(task_id = id, step = next, name = %step.name, "Step started");

        match (step.execute)(ctx(next)).await {
            Ok(output) => {
                self.store.update::<TaskRecord, _, _>(
                    id,
                    |row| row.state == TaskState::InProgress && row.step == next,
                    {
                        let output = output.clone();
                        move |row| row.data = output
                    },
                )?;
                Ok(Advance::Started { step: next, output })
            }
            Err(message) => {
                info!(task_id = id, step = next, error = %message, "Step failed");
                let mut started = task.clone();
                started.step = next;
                self.fail(&started, json!({ "error": message, "step": next })).await
            }
        }
    }

    async fn complete(&self, task: &TaskRecord, data: Option<Value>) -> Result<Advance, WorkflowError> {
        let step = task.step;
        let affected = self.store.update::<TaskRecord, _, _>(
            task.id,
            |row| row.state == TaskState::InProgress && row.step == step,
            move |row| {
                row.state = TaskState::Done;
                row.step_time = 0;
                if let Some(data) = data {
                    row.data = data;
                }
            },
        )?;
        if affected == 0 {
            return Ok(Advance::Contended);
        }
        info!(task_id = task.id, name = %task.name, "Task done");
        self.events.publish(Event::TaskCompleted {
            task_id: task.id,
            state: TaskState::Done,
        });
        Ok(Advance::Done)
    }

    async fn fail(&self, task: &TaskRecord, payload: Value) -> Result<Advance, WorkflowError> {
        let affected = self.store.update::<TaskRecord, _, _>(
            task.id,
            |row| row.state == TaskState::InProgress,
            move |row| {
                row.state = TaskState::Failed;
                row.data = payload;
            },
        )?;
        if affected == 0 {
            let state = self.task(task.id)?.state;
            return Ok(Advance::Finished(state));
        }
        info!(task_id = task.id, name = %task.name, "Task failed");
        self.events.publish(Event::TaskCompleted {
            task_id: task.id,
            state: TaskState::Failed,
        });
        Ok(Advance::Failed)
    }

    /// Fail every in-progress task whose step deadline has passed.
    pub async fn expire_overdue(&self) -> Result<usize, WorkflowError> {
        let now_ms = Utc::now().timestamp_millis();
        let scan = self.store.scan(|t: &TaskRecord| t.is_overdue(now_ms))?;
        for id in scan.corrupt {
            match self.store.quarantine::<TaskRecord>(id) {
                Ok(true) => error!(task_id = id, "Unreadable task row moved to quarantine"),
                Ok(false) => {}
                Err(e) => error!(task_id = id, error = %e, "Failed to quarantine task row"),
            }
        }

        let mut expired = 0;
        for task in scan.rows {
            let (step, step_time) = (task.step, task.step_time);
            let affected = self.store.update::<TaskRecord, _, _>(
                task.id,
                |row| {
                    row.state == TaskState::InProgress
                        && row.step == step
                        && row.step_time == step_time
                },
                move |row| {
                    row.state = TaskState::Failed;
                    row.data = json!({ "error": "step timed out", "step": step });
                },
            )?;
            if affected == 0 {
                continue;
            }
            expired += 1;
            warn!(task_id = task.id, name = %task.name, step, "Task step timed out");
            self.events.publish(Event::TaskCompleted {
                task_id: task.id,
                state: TaskState::Failed,
            });
        }
        Ok(expired)
    }
}

#[async_trait]
impl Watcher for WorkflowEngine {
    fn name(&self) -> &str {
        "workflow-timeouts"
    }

    fn cadence(&self) -> u64 {
        self.timeout_cadence
    }

    async fn check(&self) -> bool {
        match self.expire_overdue().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Workflow timeout scan failed");
                false
            }
        }
    }
}

/// A task bound to its engine.
#[derive(Clone)]
pub struct TaskHandle {
    engine: Arc<WorkflowEngine>,
    id: u64,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record(&self) -> Result<TaskRecord, WorkflowError> {
        self.engine.task(self.id)
    }

    pub async fn next(&self, input: Result<Option<Value>, String>) -> Result<Advance, WorkflowError> {
        self.engine.next(self.id, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn engine() -> (Arc<WorkflowEngine>, EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("tasks.redb")).unwrap());
        let events = EventBus::new();
        (Arc::new(WorkflowEngine::new(store, events.clone(), 1)), events, dir)
    }

    fn counting_step(name: &str, runs: Arc<AtomicUsize>) -> Step {
        Step::new(name, move |ctx| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "ran": ctx.step }))
            }
        })
    }

    #[tokio::test]
    async fn runs_all_steps_then_completes() {
        let (engine, events, _dir) = engine();
        let mut rx = events.subscribe();
        let runs = Arc::new(AtomicUsize::new(0));
        engine
            .register(
                Workflow::new("payout")
                    .step(counting_step("reserve", runs.clone()))
                    .step(counting_step("transfer", runs.clone()))
                    .step(counting_step("notify", runs.clone())),
            )
            .unwrap();

        let task = engine.make("payout", "user-1", json!({}), None).unwrap();
        for expected in 1..=3 {
            let advance = task.next(Ok(None)).await.unwrap();
            assert_eq!(
                advance,
                Advance::Started {
                    step: expected,
                    output: json!({ "ran": expected })
                }
            );
            assert_eq!(task.record().unwrap().step, expected);
        }
        assert_eq!(task.next(Ok(Some(json!("receipt")))).await.unwrap(), Advance::Done);

        let record = task.record().unwrap();
        assert_eq!(record.state, TaskState::Done);
        assert_eq!(record.data, json!("receipt"));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::TaskCompleted {
                task_id: task.id(),
                state: TaskState::Done
            }
        );

        assert_eq!(
            task.next(Ok(None)).await.unwrap(),
            Advance::Finished(TaskState::Done)
        );
    }

    #[tokio::test]
    async fn unsatisfied_verify_stalls_forever() {
        let (engine, _events, _dir) = engine();
        let runs = Arc::new(AtomicUsize::new(0));
        engine
            .register(
                Workflow::new("kyc")
                    .step(counting_step("submit", runs.clone()))
                    .step(
                        counting_step("review", runs.clone())
                            .verify(|_| async { Ok(false) }),
                    )
                    .step(counting_step("activate", runs.clone())),
            )
            .unwrap();

        let task = engine.make("kyc", "user-2", json!({}), None).unwrap();
        task.next(Ok(None)).await.unwrap();
        task.next(Ok(None)).await.unwrap();

        for _ in 0..5 {
            assert_eq!(task.next(Ok(None)).await.unwrap(), Advance::Stalled);
        }
        let record = task.record().unwrap();
        assert_eq!(record.step, 2);
        assert_eq!(record.state, TaskState::InProgress);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_next_runs_step_once() {
        let (engine, _events, _dir) = engine();
        let runs = Arc::new(AtomicUsize::new(0));
        engine
            .register(
                Workflow::new("slow")
                    .step(
                        Step::new("first", |_| async { Ok(Value::Null) }).verify(|_| async {
                            // Both callers read step 1 before either advances
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(true)
                        }),
                    )
                    .step(counting_step("second", runs.clone())),
            )
            .unwrap();

        let task = engine.make("slow", "job", json!({}), None).unwrap();
        task.next(Ok(None)).await.unwrap();

        let (a, b) = tokio::join!(task.next(Ok(None)), task.next(Ok(None)));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes.iter().filter(|o| **o == Advance::Contended).count(),
            1
        );
        assert_eq!(task.record().unwrap().step, 2);
    }

    #[tokio::test]
    async fn name_is_unique_while_in_progress() {
        let (engine, _events, _dir) = engine();
        engine
            .register(Workflow::new("one").step(Step::new("only", |_| async { Ok(Value::Null) })))
            .unwrap();

        let task = engine.make("one", "same", json!({}), None).unwrap();
        assert!(matches!(
            engine.make("one", "same", json!({}), None),
            Err(WorkflowError::DuplicateName(_))
        ));
        assert!(engine.make("one", "other", json!({}), None).is_ok());

        task.next(Ok(None)).await.unwrap();
        task.next(Ok(None)).await.unwrap();
        assert_eq!(task.record().unwrap().state, TaskState::Done);
        assert!(engine.make("one", "same", json!({}), None).is_ok());
    }

    #[tokio::test]
    async fn error_input_fails_task() {
        let (engine, events, _dir) = engine();
        let mut rx = events.subscribe();
        engine
            .register(Workflow::new("one").step(Step::new("only", |_| async { Ok(Value::Null) })))
            .unwrap();

        let task = engine.make("one", "x", json!({}), Some("alice".into())).unwrap();
        assert_eq!(
            task.next(Err("card declined".into())).await.unwrap(),
            Advance::Failed
        );
        let record = task.record().unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.data["error"], "card declined");
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::TaskCompleted {
                task_id: task.id(),
                state: TaskState::Failed
            }
        );

        assert_eq!(
            task.next(Ok(None)).await.unwrap(),
            Advance::Finished(TaskState::Failed)
        );
    }

    #[tokio::test]
    async fn failing_step_or_gate_fails_task() {
        let (engine, _events, _dir) = engine();
        engine
            .register(Workflow::new("body").step(Step::new("boom", |_| async {
                Err("upstream 500".to_string())
            })))
            .unwrap();
        engine
            .register(
                Workflow::new("gate")
                    .step(
                        Step::new("first", |_| async { Ok(Value::Null) })
                            .verify(|_| async { Err("rejected".to_string()) }),
                    )
                    .step(Step::new("second", |_| async { Ok(Value::Null) })),
            )
            .unwrap();

        let body = engine.make("body", "a", json!({}), None).unwrap();
        assert_eq!(body.next(Ok(None)).await.unwrap(), Advance::Failed);
        assert_eq!(body.record().unwrap().data["step"], 1);

        let gate = engine.make("gate", "b", json!({}), None).unwrap();
        gate.next(Ok(None)).await.unwrap();
        assert_eq!(gate.next(Ok(None)).await.unwrap(), Advance::Failed);
        assert_eq!(gate.record().unwrap().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn overdue_step_is_failed_by_scan() {
        let (engine, _events, _dir) = engine();
        engine
            .register(
                Workflow::new("timed")
                    .step(Step::new("quick", |_| async { Ok(Value::Null) }).timeout(Duration::from_millis(5)))
                    .step(Step::new("later", |_| async { Ok(Value::Null) })),
            )
            .unwrap();

        let task = engine.make("timed", "t", json!({}), None).unwrap();
        task.next(Ok(None)).await.unwrap();
        assert!(task.record().unwrap().step_time > 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.expire_overdue().await.unwrap(), 1);
        assert_eq!(task.record().unwrap().state, TaskState::Failed);
        assert_eq!(engine.expire_overdue().await.unwrap(), 0);
        assert!(engine.check().await);
    }

    #[tokio::test]
    async fn unreadable_task_row_does_not_block_timeouts() {
        let (engine, _events, _dir) = engine();
        engine
            .register(
                Workflow::new("timed")
                    .step(Step::new("quick", |_| async { Ok(Value::Null) }).timeout(Duration::from_millis(5)))
                    .step(Step::new("later", |_| async { Ok(Value::Null) })),
            )
            .unwrap();
        let task = engine.make("timed", "t", json!({}), None).unwrap();
        task.next(Ok(None)).await.unwrap();
        engine.store.put_raw::<TaskRecord>(999, b"\x00garbage").unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.expire_overdue().await.unwrap(), 1);
        assert_eq!(task.record().unwrap().state, TaskState::Failed);
        assert!(engine.store.quarantined("tasks/999").unwrap().is_some());
        assert!(engine.store.get::<TaskRecord>(999).unwrap().is_none());
        assert!(engine.check().await);
    }

    #[tokio::test]
    async fn unknown_kind_and_empty_workflow_are_rejected() {
        let (engine, _events, _dir) = engine();
        assert!(matches!(
            engine.make("missing", "x", json!({}), None),
            Err(WorkflowError::UnknownKind(_))
        ));
        assert!(matches!(
            engine.register(Workflow::new("empty")),
            Err(WorkflowError::Validation(_))
        ));
    }
}
