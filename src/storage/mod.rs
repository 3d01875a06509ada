// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Persisted Store
//!
//! The job and task tables are the single source of truth for the fleet.
//! All cross-worker coordination is expressed as conditional updates against
//! them: an update carries a predicate encoding the caller's expected prior
//! state, and the affected-row count tells the caller whether it won.
//!
//! ```text
//! relay.redb
//!   jobs        id -> TransactionJob (JSON)
//!   tasks       id -> TaskRecord (JSON)
//!   sequences   table -> last id
//!   quarantine  "table/id" -> undecodable row bytes
//! ```

pub mod database;

pub use database::{Record, Scan, Store, StoreError, StoreResult, StoreTxn};
