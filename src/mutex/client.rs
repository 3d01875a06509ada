// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Lock client used by every worker, including the one hosting the server.
//!
//! The client connects lazily on first use and reconnects after the
//! connection drops. It never grants anything locally: when the server is
//! unreachable, [`LockClient::lock`] fails.
//!
//! Dropping a `lock` or `scope_lock` future never strands a lease: a grant
//! that arrives after its caller went away is unlocked right away.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{mutex_key, ClientFrame, ServerFrame, MAX_FRAME_LENGTH};
use super::{LeaseId, MutexError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Responses awaited on one connection, keyed by request id.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<ServerFrame>>,
}

/// Outgoing half of a connection, shared with its reader task.
struct Outbox {
    out: mpsc::UnboundedSender<ClientFrame>,
    next_request: AtomicU64,
}

impl Outbox {
    fn next_request(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire-and-forget unlock; the reply is ignored.
    fn release(&self, lease_id: LeaseId) {
        let frame = ClientFrame::Unlock {
            request_id: self.next_request(),
            lease_id,
        };
        if self.out.send(frame).is_err() {
            debug!(lease_id, "Connection gone, server drops the lease itself");
        }
    }
}

/// Handle a response whose requester stopped waiting.
fn abandoned(outbox: &Outbox, frame: ServerFrame) {
    match frame {
        ServerFrame::Granted { lease_id, .. } => {
            warn!(lease_id, "Lease granted to an abandoned request, releasing");
            outbox.release(lease_id);
        }
        ServerFrame::Unlocked { request_id, ok } => {
            debug!(request_id, ok, "Unlock acknowledged");
        }
        ServerFrame::Error { request_id, message } => {
            warn!(request_id, %message, "Unsolicited lock server error");
        }
    }
}

struct Connection {
    outbox: Arc<Outbox>,
    pending: Arc<Mutex<Pending>>,
    closed: CancellationToken,
}

fn pending_guard(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, MutexError> {
        let unreachable = |reason: String| MutexError::Unreachable {
            addr: addr.to_string(),
            reason,
        };
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| unreachable("connect timed out".to_string()))?
            .map_err(|e| unreachable(e.to_string()))?;
        debug!(addr, "Connected to lock server");

        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        let (mut sink, mut lines) = framed.split();
        let (out, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let outbox = Arc::new(Outbox {
            out,
            next_request: AtomicU64::new(1),
        });
        let pending = Arc::new(Mutex::new(Pending::default()));
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = writer_closed.cancelled() => break,
                };
                let line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode lock frame");
                        continue;
                    }
                };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_outbox = Arc::clone(&outbox);
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = lines.next() => match next {
                        Some(Ok(line)) => match serde_json::from_str::<ServerFrame>(&line) {
                            Ok(frame) => {
                                let waiter = pending_guard(&reader_pending)
                                    .waiters
                                    .remove(&frame.request_id());
                                let unclaimed = match waiter {
                                    Some(waiter) => waiter.send(frame).err(),
                                    None => Some(frame),
                                };
                                if let Some(frame) = unclaimed {
                                    abandoned(&reader_outbox, frame);
                                }
                            }
                            Err(e) => warn!(error = %e, "Malformed lock server frame"),
                        },
                        Some(Err(e)) => {
                            warn!(error = %e, "Lock server connection failed");
                            break;
                        }
                        None => break,
                    },
                    _ = reader_closed.cancelled() => break,
                }
            }

            reader_closed.cancel();
            let mut pending = pending_guard(&reader_pending);
            pending.closed = true;
            // Dropping the senders wakes every waiter with Disconnected
            pending.waiters.clear();
        });

        Ok(Self {
            outbox,
            pending,
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn next_request(&self) -> u64 {
        self.outbox.next_request()
    }

    async fn request(&self, request_id: u64, frame: ClientFrame) -> Result<ServerFrame, MutexError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = pending_guard(&self.pending);
            if pending.closed {
                return Err(MutexError::Disconnected);
            }
            pending.waiters.insert(request_id, tx);
        }
        if self.outbox.out.send(frame).is_err() {
            pending_guard(&self.pending).waiters.remove(&request_id);
            return Err(MutexError::Disconnected);
        }
        rx.await.map_err(|_| MutexError::Disconnected)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Unlocks a held lease if its scope is dropped before releasing it.
struct LeaseGuard {
    conn: Arc<Connection>,
    lease_id: LeaseId,
    armed: bool,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(lease_id = self.lease_id, "Scoped lock dropped while held, releasing");
            self.conn.outbox.release(self.lease_id);
        }
    }
}

pub struct LockClient {
    addr: String,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl LockClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, MutexError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = Arc::new(Connection::open(&self.addr).await?);
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Block until the named mutex is granted to this client.
    pub async fn lock(&self, name: &str) -> Result<LeaseId, MutexError> {
        let (_, lease_id) = self.acquire(name).await?;
        Ok(lease_id)
    }

    async fn acquire(&self, name: &str) -> Result<(Arc<Connection>, LeaseId), MutexError> {
        let conn = self.connection().await?;
        let request_id = conn.next_request();
        let frame = ClientFrame::Lock {
            request_id,
            mutex: mutex_key(name),
        };

        match conn.request(request_id, frame).await? {
            ServerFrame::Granted { lease_id, .. } => {
                debug!(lease_id, mutex = name, "Lock acquired");
                Ok((conn, lease_id))
            }
            ServerFrame::Error { message, .. } => Err(MutexError::Rejected(message)),
            other => Err(MutexError::Protocol(format!(
                "unexpected response to lock: {other:?}"
            ))),
        }
    }

    pub async fn unlock(&self, lease_id: LeaseId) -> Result<(), MutexError> {
        let conn = self.connection().await?;
        let request_id = conn.next_request();
        let frame = ClientFrame::Unlock {
            request_id,
            lease_id,
        };

        match conn.request(request_id, frame).await? {
            ServerFrame::Unlocked { ok: true, .. } => {
                debug!(lease_id, "Lock released");
                Ok(())
            }
            ServerFrame::Unlocked { ok: false, .. } => Err(MutexError::UnknownLease(lease_id)),
            ServerFrame::Error { message, .. } => Err(MutexError::Rejected(message)),
            other => Err(MutexError::Protocol(format!(
                "unexpected response to unlock: {other:?}"
            ))),
        }
    }

    /// Run `f` while holding `name`, releasing it on every exit path.
    ///
    /// A panic inside `f` is re-raised after the unlock. Dropping the
    /// returned future mid-body releases the lease as well.
    pub async fn scope_lock<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MutexError>,
    {
        let (conn, lease_id) = self.acquire(name).await?;
        let mut guard = LeaseGuard {
            conn,
            lease_id,
            armed: true,
        };
        let outcome = AssertUnwindSafe(async move { f().await })
            .catch_unwind()
            .await;

        if let Err(e) = self.unlock(lease_id).await {
            // The server drops leases of lost connections on its own
            warn!(lease_id, mutex = name, error = %e, "Failed to release scoped lock");
        }
        guard.armed = false;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Drop the current connection, releasing every lease it holds.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.closed.cancel();
        }
    }
}
