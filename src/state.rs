// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::dequeue::DequeueEngine;
use crate::supervisor::Supervisor;
use crate::workflow::WorkflowEngine;

#[derive(Clone)]
pub struct AppState {
    pub dequeue: Arc<DequeueEngine>,
    pub workflow: Arc<WorkflowEngine>,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(
        dequeue: Arc<DequeueEngine>,
        workflow: Arc<WorkflowEngine>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            dequeue,
            workflow,
            supervisor,
        }
    }
}
