// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relay Coordinator - Durable Transaction Relay & Job Coordination
//!
//! Each process is one worker of a small fleet sharing a single job
//! database. Workers relay EVM transactions effectively-once, serialize
//! critical sections through a fleet-wide lock service, and drive
//! resumable multi-step workflows.
//!
//! ## Modules
//!
//! - `api` - Admin HTTP surface (Axum)
//! - `chain` - EVM client used for preflight, broadcast and receipts
//! - `dequeue` - Transaction job engine, sharding and callbacks
//! - `mutex` - Lock server, client and wire protocol
//! - `storage` - Job and task tables (redb)
//! - `supervisor` - Periodic watcher scheduling
//! - `workflow` - Step-workflow engine

pub mod api;
pub mod chain;
pub mod config;
pub mod dequeue;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod mutex;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod workflow;
