// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Distributed Mutex Service
//!
//! Fleet-wide mutual exclusion on named resources.
//!
//! One process (worker 0) runs the [`LockServer`], which keeps a FIFO queue
//! of waiters per mutex and grants them one at a time. Every process,
//! including the one hosting the server, acquires locks through a
//! [`LockClient`] over TCP.
//!
//! ```text
//!   worker 0                          worker N
//!   ┌─────────────┐   lock/unlock     ┌─────────────┐
//!   │ LockClient  │──────┐     ┌──────│ LockClient  │
//!   └─────────────┘      ▼     ▼      └─────────────┘
//!   ┌──────────────────────────────┐
//!   │ LockServer (queues + leases) │
//!   └──────────────────────────────┘
//! ```
//!
//! A lease ends on explicit unlock, when the lease timeout expires, or when
//! the holder's connection closes. Lease state lives only in the server's
//! memory and does not survive a restart of worker 0.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::LockClient;
pub use server::{ConnectionObserver, LockServer};

/// Identifier of a granted (or queued) lease.
pub type LeaseId = u64;

/// Server-side identifier of one client connection.
pub type ConnectionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum MutexError {
    #[error("lock server unreachable at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("connection to lock server lost")]
    Disconnected,

    #[error("lock protocol error: {0}")]
    Protocol(String),

    #[error("lock request rejected: {0}")]
    Rejected(String),

    #[error("unknown lease {0}")]
    UnknownLease(LeaseId),
}
