// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Lock server: per-mutex FIFO queues, leases and the TCP transport.
//!
//! Each mutex name with at least one waiter or holder owns a queue and a
//! drain task. The drain task grants the head waiter, waits for that lease
//! to end, then moves on. When the queue is empty the drain task removes it
//! and exits, so idle names cost nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientFrame, ServerFrame, MAX_FRAME_LENGTH};
use super::{ConnectionId, LeaseId};

/// Transport callbacks for connection lifecycle.
pub trait ConnectionObserver: Send + Sync {
    /// The peer went away or the server is shutting the connection down.
    fn on_closed(&self, connection: ConnectionId);

    /// The transport failed. `on_closed` follows.
    fn on_error(&self, connection: ConnectionId, error: &str);
}

struct Waiter {
    lease_id: LeaseId,
    connection: ConnectionId,
    grant: oneshot::Sender<LeaseId>,
}

struct Holder {
    mutex: String,
    connection: ConnectionId,
    /// Dropped or fired to end the lease
    release: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockTable {
    next_lease: LeaseId,
    queues: HashMap<String, VecDeque<Waiter>>,
    held: HashMap<LeaseId, Holder>,
}

pub struct LockServer {
    table: Mutex<LockTable>,
    lease_timeout: Duration,
    next_connection: AtomicU64,
}

impl LockServer {
    pub fn new(lease_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(LockTable::default()),
            lease_timeout,
            next_connection: AtomicU64::new(1),
        })
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a lock request on behalf of `connection`.
    ///
    /// Returns the lease id immediately together with a receiver that
    /// resolves once the lease reaches the head of the queue. If the request
    /// is dropped before that (connection closed), the receiver errors.
    pub fn lock(
        self: &Arc<Self>,
        connection: ConnectionId,
        mutex: &str,
    ) -> (LeaseId, oneshot::Receiver<LeaseId>) {
        let (grant, granted) = oneshot::channel();
        let mut table = self.table();
        table.next_lease += 1;
        let lease_id = table.next_lease;

        let waiter = Waiter {
            lease_id,
            connection,
            grant,
        };

        match table.queues.get_mut(mutex) {
            Some(queue) => queue.push_back(waiter),
            None => {
                table
                    .queues
                    .insert(mutex.to_string(), VecDeque::from([waiter]));
                let server = Arc::clone(self);
                let name = mutex.to_string();
                tokio::spawn(async move { server.drain(name).await });
            }
        }
        debug!(lease_id, connection, mutex, "Lock requested");
        (lease_id, granted)
    }

    /// End a lease held (or still queued) by `connection`.
    ///
    /// Returns `false` when the lease is unknown or owned by another
    /// connection.
    pub fn unlock(&self, connection: ConnectionId, lease_id: LeaseId) -> bool {
        let mut table = self.table();

        if table
            .held
            .get(&lease_id)
            .is_some_and(|h| h.connection == connection)
        {
            if let Some(holder) = table.held.remove(&lease_id) {
                debug!(lease_id, mutex = %holder.mutex, "Lease released");
                let _ = holder.release.send(());
                return true;
            }
        }

        // Cancelling a request that has not been granted yet
        for queue in table.queues.values_mut() {
            if let Some(pos) = queue
                .iter()
                .position(|w| w.lease_id == lease_id && w.connection == connection)
            {
                queue.remove(pos);
                debug!(lease_id, "Queued lock request cancelled");
                return true;
            }
        }
        false
    }

    /// Drop every lease and queued request of a closed connection.
    pub fn connection_closed(&self, connection: ConnectionId) {
        let mut table = self.table();

        let before = table.held.len();
        // Dropping the release senders ends the leases
        table.held.retain(|_, h| h.connection != connection);
        let released = before - table.held.len();

        let mut purged = 0;
        for queue in table.queues.values_mut() {
            let before = queue.len();
            queue.retain(|w| w.connection != connection);
            purged += before - queue.len();
        }

        if released > 0 || purged > 0 {
            info!(connection, released, purged, "Released leases of closed connection");
        }
    }

    /// Number of mutex names that currently have a queue.
    pub fn active_queues(&self) -> usize {
        self.table().queues.len()
    }

    async fn drain(self: Arc<Self>, mutex: String) {
        loop {
            let (lease_id, grant, released) = {
                let mut table = self.table();
                let next = table.queues.get_mut(&mutex).and_then(VecDeque::pop_front);
                let Some(waiter) = next else {
                    table.queues.remove(&mutex);
                    debug!(mutex = %mutex, "Queue drained");
                    return;
                };
                let (release, released) = oneshot::channel();
                table.held.insert(
                    waiter.lease_id,
                    Holder {
                        mutex: mutex.clone(),
                        connection: waiter.connection,
                        release,
                    },
                );
                (waiter.lease_id, waiter.grant, released)
            };

            if grant.send(lease_id).is_err() {
                // Requester vanished between queueing and grant
                self.table().held.remove(&lease_id);
                continue;
            }
            debug!(lease_id, mutex = %mutex, "Lease granted");

            // Ok: explicit unlock. Err: holder dropped by connection close.
            if tokio::time::timeout(self.lease_timeout, released).await.is_err()
                && self.table().held.remove(&lease_id).is_some()
            {
                warn!(
                    lease_id,
                    mutex = %mutex,
                    timeout_secs = self.lease_timeout.as_secs(),
                    "Lease expired without unlock"
                );
            }
        }
    }

    fn handle_frame(
        self: &Arc<Self>,
        connection: ConnectionId,
        line: &str,
        out: &mpsc::UnboundedSender<ServerFrame>,
    ) {
        let frame: ClientFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = out.send(ServerFrame::Error {
                    request_id: 0,
                    message: format!("malformed frame: {e}"),
                });
                return;
            }
        };

        match frame {
            ClientFrame::Lock { request_id, mutex } => {
                if mutex.is_empty() {
                    let _ = out.send(ServerFrame::Error {
                        request_id,
                        message: "mutex name must not be empty".to_string(),
                    });
                    return;
                }
                let (_, granted) = self.lock(connection, &mutex);
                let out = out.clone();
                tokio::spawn(async move {
                    if let Ok(lease_id) = granted.await {
                        let _ = out.send(ServerFrame::Granted {
                            request_id,
                            lease_id,
                        });
                    }
                });
            }
            ClientFrame::Unlock {
                request_id,
                lease_id,
            } => {
                let ok = self.unlock(connection, lease_id);
                let _ = out.send(ServerFrame::Unlocked { request_id, ok });
            }
        }
    }
}

impl ConnectionObserver for LockServer {
    fn on_closed(&self, connection: ConnectionId) {
        debug!(connection, "Lock client disconnected");
        self.connection_closed(connection);
    }

    fn on_error(&self, connection: ConnectionId, error: &str) {
        warn!(connection, error, "Lock client connection error");
    }
}

/// Accept lock clients on `listener` until `shutdown` fires.
pub async fn serve(server: Arc<LockServer>, listener: TcpListener, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "Lock server listening"),
        Err(e) => warn!(error = %e, "Lock server listening on unknown address"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection = server.next_connection.fetch_add(1, Ordering::Relaxed);
                    debug!(connection, %peer, "Lock client connected");
                    let server = Arc::clone(&server);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        handle_connection(server, connection, stream, shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept lock client"),
            },
            _ = shutdown.cancelled() => {
                info!("Lock server shutting down");
                return;
            }
        }
    }
}

async fn handle_connection(
    server: Arc<LockServer>,
    connection: ConnectionId,
    stream: TcpStream,
    shutdown: CancellationToken,
) {
    let observer: Arc<dyn ConnectionObserver> = server.clone();
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let (mut sink, mut lines) = framed.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
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

    loop {
        tokio::select! {
            next = lines.next() => match next {
                Some(Ok(line)) => server.handle_frame(connection, &line, &out_tx),
                Some(Err(e)) => {
                    observer.on_error(connection, &e.to_string());
                    break;
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    observer.on_closed(connection);
    writer.abort();
}
