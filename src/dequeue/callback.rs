// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delivery of job outcomes to their callbacks.
//!
//! Delivery happens after the terminal status is persisted and its outcome
//! is only logged: a failed notification never reopens a job.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{Callback, JobStatus, TransactionJob};
use crate::mutex::{LockClient, MutexError};

/// Body POSTed to HTTP callbacks and passed to local handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: u64,
    pub status: JobStatus,
    pub txid: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl From<&TransactionJob> for CallbackPayload {
    fn from(job: &TransactionJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            txid: job.txid.clone(),
            result: job.result.clone(),
        }
    }
}

/// In-process callback target.
pub type LocalHandler =
    Arc<dyn Fn(CallbackPayload) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Named local handlers, looked up by `Callback::Local { handle }`.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<String, LocalHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: impl Into<String>, handler: LocalHandler) {
        let handle = handle.into();
        debug!(handle = %handle, "Registering local callback");
        match self.handlers.write() {
            Ok(mut handlers) => handlers.insert(handle, handler),
            Err(poisoned) => poisoned.into_inner().insert(handle, handler),
        };
    }

    pub fn get(&self, handle: &str) -> Option<LocalHandler> {
        match self.handlers.read() {
            Ok(handlers) => handlers.get(handle).cloned(),
            Err(poisoned) => poisoned.into_inner().get(handle).cloned(),
        }
    }
}

/// Exponential backoff for HTTP callback attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `attempts` failures (1-indexed).
    ///
    /// `base_delay * multiplier^(attempts - 1)`
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("callback POST failed after {attempts} attempts: {reason}")]
    Http { attempts: u32, reason: String },

    #[error("no local callback registered as `{0}`")]
    UnknownHandle(String),

    #[error("local callback failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Lock(#[from] MutexError),
}

pub struct CallbackDispatcher {
    http: reqwest::Client,
    registry: Arc<CallbackRegistry>,
    policy: RetryPolicy,
    /// Fleet lock held around each delivery when set
    lock: Option<Arc<LockClient>>,
}

impl CallbackDispatcher {
    pub fn new(registry: Arc<CallbackRegistry>, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            registry,
            policy,
            lock: None,
        }
    }

    /// Serialize deliveries for the same job across the fleet.
    pub fn with_lock(mut self, lock: Arc<LockClient>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Deliver under the fleet lock for this job, if one is configured.
    ///
    /// An unreachable lock server fails the delivery rather than running it
    /// unguarded.
    pub async fn dispatch(
        &self,
        callback: &Callback,
        payload: &CallbackPayload,
    ) -> Result<(), CallbackError> {
        match &self.lock {
            Some(lock) => {
                let mutex = format!("job-callback:{}", payload.job_id);
                lock.scope_lock(&mutex, || self.deliver(callback, payload))
                    .await
            }
            None => self.deliver(callback, payload).await,
        }
    }

    pub async fn deliver(
        &self,
        callback: &Callback,
        payload: &CallbackPayload,
    ) -> Result<(), CallbackError> {
        match callback {
            Callback::Http { url } => self.post_with_retry(url, payload).await,
            Callback::Local { handle } => {
                let handler = self
                    .registry
                    .get(handle)
                    .ok_or_else(|| CallbackError::UnknownHandle(handle.clone()))?;
                handler(payload.clone()).await.map_err(CallbackError::Handler)
            }
        }
    }

    async fn post_with_retry(&self, url: &str, payload: &CallbackPayload) -> Result<(), CallbackError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let reason = match self.http.post(url).json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(job_id = payload.job_id, url, attempts, "Callback delivered");
                    return Ok(());
                }
                Ok(response) => format!("status {}", response.status()),
                Err(e) => e.to_string(),
            };

            if attempts >= self.policy.max_attempts {
                return Err(CallbackError::Http { attempts, reason });
            }
            let delay = self.policy.next_delay(attempts);
            warn!(
                job_id = payload.job_id,
                url,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                reason = %reason,
                "Callback attempt failed"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
