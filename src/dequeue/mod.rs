// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Transaction Dequeue Engine
//!
//! Drives persisted [`TransactionJob`]s through their submission state
//! machine so every requested transaction lands on chain effectively once,
//! across crashes and across a fleet of workers sharing one job table.
//!
//! ```text
//!   Pending ──claim──► InFlight ──preflight──► send ──checkpoint txid──┐
//!                        │   ▲                                         │
//!                        │   └──── stale: reclaim, re-send pinned ◄────┤
//!                        ▼                                             ▼
//!                     Failed ◄──── reverted ─────── receipt ───► Confirmed
//! ```
//!
//! Guards, outermost first:
//!
//! 1. Shard ownership: only the worker with `index == owner(account)` acts.
//! 2. Executing set: one in-process drive per job id at a time.
//! 3. Conditional updates: every transition is gated on the row still
//!    showing the status, claim timestamp and txid this worker last saw.
//!    Zero affected rows means another actor moved first.
//!
//! The txid is written once, right after the node accepts the broadcast and
//! before any receipt exists. Recovery of an InFlight job with a txid polls
//! for its receipt instead of broadcasting again. Send options are pinned
//! (nonce and fees) at the same checkpoint, so a stale re-broadcast
//! reproduces the identical transaction and hash.

pub mod callback;
pub mod shard;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::chain::{validate_address, CallRequest, ChainClient, ChainError, Receipt};
use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::models::{Callback, JobReview, JobStatus, NewJob, TransactionJob};
use crate::storage::{Store, StoreError};
use crate::supervisor::Watcher;

pub use callback::{CallbackDispatcher, CallbackPayload, CallbackRegistry, RetryPolicy};
pub use shard::ShardAssignment;

#[derive(Debug, thiserror::Error)]
pub enum DequeueError {
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(u64),

    #[error("job {id} is not finished (status {status:?})")]
    Pending { id: u64, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct DequeueConfig {
    pub shards: ShardAssignment,
    /// Age of the last claim after which an InFlight job may be reclaimed
    pub stale_after: Duration,
    /// Preflight attempts when the node is unreachable
    pub preflight_attempts: u32,
    pub preflight_backoff: Duration,
    /// Receipt polls right after a broadcast
    pub receipt_polls: u32,
    pub receipt_interval: Duration,
    /// Supervisor ticks between recovery scans
    pub recovery_cadence: u64,
    /// Jobs driven at once by a recovery scan
    pub recovery_concurrency: usize,
}

impl Default for DequeueConfig {
    fn default() -> Self {
        Self {
            shards: ShardAssignment::SOLO,
            stale_after: crate::config::DEFAULT_STALE_AFTER,
            preflight_attempts: 3,
            preflight_backoff: Duration::from_millis(500),
            receipt_polls: 10,
            receipt_interval: Duration::from_secs(3),
            recovery_cadence: 30,
            recovery_concurrency: 16,
        }
    }
}

impl DequeueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shards: ShardAssignment::new(config.worker_index, config.worker_count),
            stale_after: config.stale_after,
            recovery_cadence: config.recovery_cadence,
            ..Self::default()
        }
    }
}

/// What a single drive of a job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Another drive of this job is running in this process
    Busy,
    /// Account belongs to another worker
    NotOwned,
    /// A conditional update matched nothing; someone else moved first
    Lost,
    /// Already Confirmed or Failed
    Terminal,
    /// Node unreachable; the next scan retries
    Deferred,
    /// InFlight within the staleness window, nothing to do
    Waiting,
    /// Transaction accepted by the node, receipt pending
    Broadcast,
    Confirmed,
    Failed,
}

/// Per-scan counters returned by [`DequeueEngine::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub foreign: usize,
    pub busy: usize,
    pub broadcast: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub waiting: usize,
    pub errors: usize,
    /// Undecodable rows moved to quarantine
    pub corrupt: usize,
}

impl RecoveryReport {
    fn record(&mut self, outcome: DriveOutcome) {
        match outcome {
            DriveOutcome::Busy => self.busy += 1,
            DriveOutcome::NotOwned => self.foreign += 1,
            DriveOutcome::Broadcast => self.broadcast += 1,
            DriveOutcome::Confirmed => self.confirmed += 1,
            DriveOutcome::Failed => self.failed += 1,
            DriveOutcome::Lost
            | DriveOutcome::Terminal
            | DriveOutcome::Deferred
            | DriveOutcome::Waiting => self.waiting += 1,
        }
    }
}

/// Removes a job id from the executing set when the drive ends.
struct Executing<'a> {
    set: &'a Mutex<HashSet<u64>>,
    id: u64,
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        match self.set.lock() {
            Ok(mut set) => set.remove(&self.id),
            Err(poisoned) => poisoned.into_inner().remove(&self.id),
        };
    }
}

/// Whether `row` still shows the claim this worker holds.
fn unchanged(row: &TransactionJob, seen: &TransactionJob) -> bool {
    row.status == seen.status && row.active == seen.active && row.txid == seen.txid
}

fn call_request(job: &TransactionJob) -> CallRequest {
    CallRequest {
        from: job.account.clone(),
        to: job.contract.clone(),
        method: job.method.clone(),
        args: job.args.clone(),
        options: job.opts.clone(),
    }
}

fn failure(stage: &str, error: &ChainError) -> serde_json::Value {
    json!({ "stage": stage, "error": error.to_string() })
}

pub struct DequeueEngine {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    callbacks: Arc<CallbackDispatcher>,
    events: EventBus,
    config: DequeueConfig,
    executing: Mutex<HashSet<u64>>,
}

impl DequeueEngine {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        callbacks: Arc<CallbackDispatcher>,
        events: EventBus,
        config: DequeueConfig,
    ) -> Self {
        Self {
            store,
            chain,
            callbacks,
            events,
            config,
            executing: Mutex::new(HashSet::new()),
        }
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        self.callbacks.registry()
    }

    pub fn shards(&self) -> ShardAssignment {
        self.config.shards
    }

    /// Persist a new job and, if this worker owns its account, start
    /// driving it in the background. Returns as soon as the row exists.
    pub fn enqueue(self: &Arc<Self>, request: NewJob) -> Result<u64, DequeueError> {
        validate(&request, self.chain.as_ref())?;

        let mut job = TransactionJob::new_pending(request);
        let id = self.store.insert(&mut job)?;
        info!(job_id = id, account = %job.account, method = %job.method, "Job enqueued");

        if self.config.shards.owns(&job.account) {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                match engine.drive(id).await {
                    Ok(outcome) => debug!(job_id = id, ?outcome, "Immediate attempt finished"),
                    Err(e) => warn!(job_id = id, error = %e, "Immediate attempt failed"),
                }
            });
        } else {
            debug!(
                job_id = id,
                owner = self.config.shards.owner_of(&job.account),
                "Job owned by another worker"
            );
        }

        Ok(id)
    }

    /// Terminal outcome of a job.
    pub fn review(&self, id: u64) -> Result<JobReview, DequeueError> {
        let job: TransactionJob = self.store.get(id)?.ok_or(DequeueError::NotFound(id))?;
        if !job.status.is_terminal() {
            return Err(DequeueError::Pending {
                id,
                status: job.status,
            });
        }
        Ok(JobReview::from(&job))
    }

    /// Drive every non-terminal job this worker owns, a bounded number at
    /// a time. Rows that no longer decode are quarantined so they cannot
    /// hold up the rest of the table.
    pub async fn recover(&self) -> Result<RecoveryReport, DequeueError> {
        let scan = self
            .store
            .scan(|job: &TransactionJob| !job.status.is_terminal())?;

        let mut report = RecoveryReport::default();
        for id in scan.corrupt {
            match self.store.quarantine::<TransactionJob>(id) {
                Ok(true) => {
                    error!(job_id = id, "Unreadable job row moved to quarantine");
                    report.corrupt += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = id, error = %e, "Failed to quarantine job row");
                    report.errors += 1;
                }
            }
        }

        let mut owned = Vec::with_capacity(scan.rows.len());
        for job in scan.rows {
            report.scanned += 1;
            if self.config.shards.owns(&job.account) {
                owned.push(job.id);
            } else {
                report.foreign += 1;
            }
        }

        let outcomes: Vec<_> = stream::iter(owned)
            .map(|id| async move { (id, self.drive(id).await) })
            .buffer_unordered(self.config.recovery_concurrency.max(1))
            .collect()
            .await;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!(job_id = id, error = %e, "Recovery of job failed");
                    report.errors += 1;
                }
            }
        }

        if report.scanned > 0 {
            debug!(?report, "Recovery scan finished");
        }
        Ok(report)
    }

    fn begin(&self, id: u64) -> Option<Executing<'_>> {
        let inserted = match self.executing.lock() {
            Ok(mut set) => set.insert(id),
            Err(poisoned) => poisoned.into_inner().insert(id),
        };
        inserted.then(|| Executing {
            set: &self.executing,
            id,
        })
    }

    /// Advance one job as far as it can go right now.
    pub async fn drive(&self, id: u64) -> Result<DriveOutcome, DequeueError> {
        let Some(_executing) = self.begin(id) else {
            debug!(job_id = id, "Job already executing");
            return Ok(DriveOutcome::Busy);
        };

        let job: TransactionJob = self.store.get(id)?.ok_or(DequeueError::NotFound(id))?;
        if !self.config.shards.owns(&job.account) {
            return Ok(DriveOutcome::NotOwned);
        }

        match job.status {
            JobStatus::Confirmed | JobStatus::Failed => Ok(DriveOutcome::Terminal),
            JobStatus::Pending => self.submit(job).await,
            JobStatus::InFlight => match job.txid.clone() {
                Some(txid) => self.confirm(job, txid).await,
                None if job.is_stale(Utc::now(), self.config.stale_after) => {
                    info!(job_id = id, "Reclaiming stale job that never broadcast");
                    self.submit(job).await
                }
                None => Ok(DriveOutcome::Waiting),
            },
        }
    }

    /// Conditionally mark the job InFlight with a fresh claim timestamp.
    fn claim(&self, job: &mut TransactionJob) -> Result<bool, DequeueError> {
        let now = Utc::now();
        let seen = job.clone();
        let affected = self.store.update::<TransactionJob, _, _>(
            job.id,
            |row| unchanged(row, &seen),
            |row| {
                row.status = JobStatus::InFlight;
                row.active = now;
            },
        )?;
        if affected == 0 {
            debug!(job_id = job.id, "Claim lost to another actor");
            return Ok(false);
        }
        job.status = JobStatus::InFlight;
        job.active = now;
        Ok(true)
    }

    /// Give up a claim whose send never reached the node. The claim
    /// timestamp is zeroed so the next scan reclaims the job right away.
    fn release(
        &self,
        job: &TransactionJob,
        reason: &ChainError,
    ) -> Result<DriveOutcome, DequeueError> {
        let seen = job.clone();
        let affected = self.store.update::<TransactionJob, _, _>(
            job.id,
            |row| unchanged(row, &seen),
            |row| row.active = DateTime::<Utc>::UNIX_EPOCH,
        )?;
        if affected == 0 {
            debug!(job_id = job.id, "Release lost to another actor");
            return Ok(DriveOutcome::Lost);
        }
        warn!(job_id = job.id, error = %reason, "Claim released, next scan retries");
        Ok(DriveOutcome::Deferred)
    }

    /// Claim, preflight, broadcast and checkpoint.
    async fn submit(&self, mut job: TransactionJob) -> Result<DriveOutcome, DequeueError> {
        if !self.claim(&mut job)? {
            return Ok(DriveOutcome::Lost);
        }
        debug!(job_id = job.id, account = %job.account, "Job claimed");

        let request = call_request(&job);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.chain.call(&request).await {
                Ok(_) => break,
                Err(e) if e.is_transient() => {
                    if attempt >= self.config.preflight_attempts {
                        warn!(job_id = job.id, attempts = attempt, "Preflight unavailable");
                        return self.release(&job, &e);
                    }
                    warn!(job_id = job.id, attempt, error = %e, "Preflight failed, retrying");
                    tokio::time::sleep(self.config.preflight_backoff * attempt).await;
                }
                Err(e) => {
                    info!(job_id = job.id, error = %e, "Preflight rejected");
                    return self
                        .finish(&job, JobStatus::Failed, failure("preflight", &e))
                        .await;
                }
            }
        }

        let broadcast = match self.chain.send(&request).await {
            Ok(broadcast) => broadcast,
            Err(e @ ChainError::NotSubmitted(_)) => return self.release(&job, &e),
            Err(e) if e.is_transient() => {
                // The node may or may not have the transaction
                warn!(
                    job_id = job.id,
                    error = %e,
                    "Broadcast outcome unknown, job stays in flight until stale"
                );
                return Ok(DriveOutcome::Deferred);
            }
            Err(e) => {
                info!(job_id = job.id, error = %e, "Broadcast rejected");
                return self
                    .finish(&job, JobStatus::Failed, failure("broadcast", &e))
                    .await;
            }
        };

        let txid = broadcast.txid.clone();
        let pinned = broadcast.options.clone();
        let seen = job.clone();
        let affected = self.store.update::<TransactionJob, _, _>(
            job.id,
            |row| unchanged(row, &seen) && row.txid.is_none(),
            {
                let txid = txid.clone();
                let pinned = pinned.clone();
                move |row| {
                    row.txid = Some(txid);
                    row.opts = pinned;
                }
            },
        )?;
        if affected == 0 {
            error!(job_id = job.id, %txid, "Broadcast checkpoint rejected, row changed underneath");
            return Ok(DriveOutcome::Lost);
        }
        job.txid = Some(txid.clone());
        job.opts = pinned;
        info!(job_id = job.id, %txid, nonce = ?job.opts.nonce, "Transaction broadcast");

        match self.poll_receipt(job.id, &txid, self.config.receipt_polls).await {
            Ok(Some(receipt)) => self.settle(&job, &receipt).await,
            Ok(None) => Ok(DriveOutcome::Broadcast),
            Err(_) => Ok(DriveOutcome::Broadcast),
        }
    }

    /// Resolve an InFlight job that already has a txid.
    async fn confirm(&self, job: TransactionJob, txid: String) -> Result<DriveOutcome, DequeueError> {
        match self.poll_receipt(job.id, &txid, 1).await {
            Ok(Some(receipt)) => self.settle(&job, &receipt).await,
            Ok(None) if job.is_stale(Utc::now(), self.config.stale_after) => {
                self.rebroadcast(job, txid).await
            }
            Ok(None) => Ok(DriveOutcome::Waiting),
            Err(_) => Ok(DriveOutcome::Deferred),
        }
    }

    /// Reclaim a stale job and send its pinned transaction again.
    async fn rebroadcast(
        &self,
        mut job: TransactionJob,
        txid: String,
    ) -> Result<DriveOutcome, DequeueError> {
        let now = Utc::now();
        let seen = job.clone();
        let affected = self.store.update::<TransactionJob, _, _>(
            job.id,
            |row| unchanged(row, &seen),
            |row| row.active = now,
        )?;
        if affected == 0 {
            debug!(job_id = job.id, "Stale reclaim lost to another actor");
            return Ok(DriveOutcome::Lost);
        }
        job.active = now;
        warn!(
            job_id = job.id,
            %txid,
            "No receipt past staleness threshold, re-broadcasting pinned transaction"
        );

        match self.chain.send(&call_request(&job)).await {
            Ok(broadcast) if broadcast.txid.eq_ignore_ascii_case(&txid) => {}
            Ok(broadcast) => {
                error!(
                    job_id = job.id,
                    %txid,
                    divergent = %broadcast.txid,
                    "Re-broadcast produced a different hash"
                );
                let result = json!({
                    "stage": "rebroadcast",
                    "error": "re-broadcast produced a different transaction hash",
                    "divergent_txid": broadcast.txid,
                });
                return self.finish(&job, JobStatus::Failed, result).await;
            }
            Err(e) if e.is_already_known() => {}
            Err(e) if e.is_transient() => return self.release(&job, &e),
            Err(e) => {
                info!(job_id = job.id, error = %e, "Re-broadcast rejected");
                return self
                    .finish(&job, JobStatus::Failed, failure("rebroadcast", &e))
                    .await;
            }
        }

        match self.poll_receipt(job.id, &txid, self.config.receipt_polls).await {
            Ok(Some(receipt)) => self.settle(&job, &receipt).await,
            _ => Ok(DriveOutcome::Broadcast),
        }
    }

    async fn poll_receipt(
        &self,
        job_id: u64,
        txid: &str,
        polls: u32,
    ) -> Result<Option<Receipt>, ChainError> {
        for poll in 0..polls.max(1) {
            if poll > 0 {
                tokio::time::sleep(self.config.receipt_interval).await;
            }
            match self.chain.get_receipt(txid).await {
                Ok(Some(receipt)) => return Ok(Some(receipt)),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id, txid, error = %e, "Receipt lookup failed");
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    async fn settle(&self, job: &TransactionJob, receipt: &Receipt) -> Result<DriveOutcome, DequeueError> {
        let status = if receipt.reverted() {
            JobStatus::Failed
        } else {
            JobStatus::Confirmed
        };
        let result = json!({
            "block_number": receipt.block_number,
            "gas_used": receipt.gas_used,
            "success": receipt.success,
        });
        self.finish(job, status, result).await
    }

    /// Persist the terminal status, then notify.
    async fn finish(
        &self,
        job: &TransactionJob,
        status: JobStatus,
        result: serde_json::Value,
    ) -> Result<DriveOutcome, DequeueError> {
        let seen = job.clone();
        let affected = self.store.update::<TransactionJob, _, _>(
            job.id,
            |row| unchanged(row, &seen),
            {
                let result = result.clone();
                move |row| {
                    row.status = status;
                    row.result = Some(result);
                }
            },
        )?;
        if affected == 0 {
            debug!(job_id = job.id, "Finalization lost to another actor");
            return Ok(DriveOutcome::Lost);
        }

        let mut finished = job.clone();
        finished.status = status;
        finished.result = Some(result);
        info!(job_id = job.id, ?status, txid = ?finished.txid, "Job finalized");

        self.events.publish(Event::JobFinalized {
            job_id: job.id,
            status,
        });

        if let Some(callback) = finished.callback.clone() {
            let dispatcher = Arc::clone(&self.callbacks);
            let payload = CallbackPayload::from(&finished);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.dispatch(&callback, &payload).await {
                    warn!(job_id = payload.job_id, error = %e, "Callback delivery failed");
                }
            });
        }

        Ok(match status {
            JobStatus::Confirmed => DriveOutcome::Confirmed,
            _ => DriveOutcome::Failed,
        })
    }
}

fn validate(request: &NewJob, chain: &dyn ChainClient) -> Result<(), DequeueError> {
    let invalid = |e: ChainError| DequeueError::Validation(e.to_string());

    validate_address(&request.account).map_err(invalid)?;
    if !chain.can_sign(&request.account) {
        return Err(DequeueError::Validation(format!(
            "account {} is not managed by this relay",
            request.account
        )));
    }
    if request.method.trim().is_empty() {
        return Err(DequeueError::Validation("method must not be empty".into()));
    }
    let args = request
        .args
        .as_array()
        .ok_or_else(|| DequeueError::Validation("args must be a JSON array".into()))?;

    match &request.contract {
        Some(contract) => {
            validate_address(contract).map_err(invalid)?;
            if !request.method.contains('(') {
                return Err(DequeueError::Validation(format!(
                    "method `{}` is not a function signature",
                    request.method
                )));
            }
        }
        None => {
            let recipient = args.first().and_then(|v| v.as_str()).ok_or_else(|| {
                DequeueError::Validation("value transfer needs a recipient as first argument".into())
            })?;
            validate_address(recipient).map_err(invalid)?;
        }
    }

    if let Some(Callback::Http { url }) = &request.callback {
        url::Url::parse(url)
            .map_err(|e| DequeueError::Validation(format!("invalid callback url: {e}")))?;
    }
    Ok(())
}

#[async_trait]
impl Watcher for DequeueEngine {
    fn name(&self) -> &str {
        "transaction-recovery"
    }

    fn cadence(&self) -> u64 {
        self.config.recovery_cadence
    }

    async fn check(&self) -> bool {
        match self.recover().await {
            Ok(report) => report.errors == 0,
            Err(e) => {
                warn!(error = %e, "Recovery scan failed");
                false
            }
        }
    }
}
