// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded job database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `jobs`: id → serialized TransactionJob
//! - `tasks`: id → serialized TaskRecord
//! - `sequences`: table name → last allocated id
//! - `quarantine`: `"<table>/<id>"` → raw bytes of a row that no longer decodes
//!
//! Every conditional update reads, checks and writes inside one redb write
//! transaction. Write transactions are serialized by redb, so the returned
//! affected-row count is an exact compare-and-swap signal.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::models::{TaskRecord, TransactionJob};

// =============================================================================
// Table Definitions
// =============================================================================

const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");

const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Map: table name → last id handed out for that table.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Map: `"<table>/<id>"` → raw bytes moved out of a row table.
const QUARANTINE: TableDefinition<&str, &[u8]> = TableDefinition::new("quarantine");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Row mapping
// =============================================================================

/// A row type persisted in its own id-keyed table.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, u64, &'static [u8]>;
    const SEQUENCE: &'static str;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}

impl Record for TransactionJob {
    const TABLE: TableDefinition<'static, u64, &'static [u8]> = JOBS;
    const SEQUENCE: &'static str = "jobs";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

impl Record for TaskRecord {
    const TABLE: TableDefinition<'static, u64, &'static [u8]> = TASKS;
    const SEQUENCE: &'static str = "tasks";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

/// Result of a full table scan.
#[derive(Debug)]
pub struct Scan<R> {
    /// Decodable rows matching the filter, ordered by id
    pub rows: Vec<R>,
    /// Ids of rows that failed to decode
    pub corrupt: Vec<u64>,
}

/// Decode every row of `R::TABLE`, collecting undecodable ids instead of
/// failing the whole scan.
fn scan_table<R, T, F>(table: &T, filter: F) -> StoreResult<Scan<R>>
where
    R: Record,
    T: ReadableTable<u64, &'static [u8]>,
    F: Fn(&R) -> bool,
{
    let mut scan = Scan {
        rows: Vec::new(),
        corrupt: Vec::new(),
    };
    for entry in table.iter()? {
        let (key, value) = entry?;
        match serde_json::from_slice::<R>(value.value()) {
            Ok(row) if filter(&row) => scan.rows.push(row),
            Ok(_) => {}
            Err(e) => {
                warn!(table = R::SEQUENCE, id = key.value(), error = %e, "Skipping undecodable row");
                scan.corrupt.push(key.value());
            }
        }
    }
    Ok(scan)
}

// =============================================================================
// Store
// =============================================================================

/// Embedded ACID store shared by every engine in the process.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(JOBS)?;
            let _ = write_txn.open_table(TASKS)?;
            let _ = write_txn.open_table(SEQUENCES)?;
            let _ = write_txn.open_table(QUARANTINE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert a row, assigning the next id of its table.
    pub fn insert<R: Record>(&self, row: &mut R) -> StoreResult<u64> {
        self.transaction(|txn| txn.insert(row))
    }

    /// Look up a single row by id.
    pub fn get<R: Record>(&self, id: u64) -> StoreResult<Option<R>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::TABLE)?;
        let row = match table.get(id)? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        Ok(row)
    }

    /// All decodable rows matching `filter`, ordered by id. Undecodable rows
    /// are logged and skipped; use [`Store::scan`] to learn their ids.
    pub fn select<R, F>(&self, filter: F) -> StoreResult<Vec<R>>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        Ok(self.scan(filter)?.rows)
    }

    /// Like [`Store::select`], also reporting rows that fail to decode.
    pub fn scan<R, F>(&self, filter: F) -> StoreResult<Scan<R>>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(R::TABLE)?;
        scan_table(&table, filter)
    }

    /// Move a row that no longer decodes out of its table so scans stop
    /// tripping over it. Returns `false` if the row is gone or decodes fine.
    pub fn quarantine<R: Record>(&self, id: u64) -> StoreResult<bool> {
        self.transaction(|txn| {
            let mut table = txn.table::<R>()?;
            let raw = match table.get(id)? {
                Some(value) => value.value().to_vec(),
                None => return Ok(false),
            };
            if serde_json::from_slice::<R>(&raw).is_ok() {
                return Ok(false);
            }
            table.remove(id)?;
            let mut quarantine = txn.txn.open_table(QUARANTINE)?;
            quarantine.insert(format!("{}/{id}", R::SEQUENCE).as_str(), raw.as_slice())?;
            Ok(true)
        })
    }

    /// Write raw bytes under `id`, bypassing serialization.
    #[cfg(test)]
    pub(crate) fn put_raw<R: Record>(&self, id: u64, bytes: &[u8]) -> StoreResult<()> {
        self.transaction(|txn| {
            txn.table::<R>()?.insert(id, bytes)?;
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn quarantined(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUARANTINE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    /// Conditional update of a single row.
    ///
    /// `patch` is applied only if the row exists and `predicate` holds for
    /// its current value. Returns the number of affected rows (0 or 1).
    pub fn update<R, P, U>(&self, id: u64, predicate: P, patch: U) -> StoreResult<usize>
    where
        R: Record,
        P: FnOnce(&R) -> bool,
        U: FnOnce(&mut R),
    {
        self.transaction(|txn| txn.update(id, predicate, patch))
    }

    /// Run `f` inside a single write transaction.
    ///
    /// Changes are committed only if `f` returns `Ok`.
    pub fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> StoreResult<T>,
    {
        let write_txn = self.db.begin_write()?;
        let value = {
            let mut txn = StoreTxn { txn: &write_txn };
            f(&mut txn)?
        };
        write_txn.commit()?;
        Ok(value)
    }
}

/// Row access inside an open write transaction.
pub struct StoreTxn<'a> {
    txn: &'a WriteTransaction,
}

impl StoreTxn<'_> {
    fn table<R: Record>(&self) -> StoreResult<Table<'_, u64, &'static [u8]>> {
        Ok(self.txn.open_table(R::TABLE)?)
    }

    fn next_id(&self, sequence: &str) -> StoreResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES)?;
        let next = table.get(sequence)?.map(|v| v.value()).unwrap_or(0) + 1;
        table.insert(sequence, next)?;
        Ok(next)
    }

    pub fn insert<R: Record>(&mut self, row: &mut R) -> StoreResult<u64> {
        let id = self.next_id(R::SEQUENCE)?;
        row.set_id(id);
        let json = serde_json::to_vec(row)?;
        let mut table = self.table::<R>()?;
        table.insert(id, json.as_slice())?;
        Ok(id)
    }

    pub fn get<R: Record>(&self, id: u64) -> StoreResult<Option<R>> {
        let table = self.table::<R>()?;
        let row = match table.get(id)? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        Ok(row)
    }

    pub fn select<R, F>(&self, filter: F) -> StoreResult<Vec<R>>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        let table = self.table::<R>()?;
        Ok(scan_table(&table, filter)?.rows)
    }

    pub fn update<R, P, U>(&mut self, id: u64, predicate: P, patch: U) -> StoreResult<usize>
    where
        R: Record,
        P: FnOnce(&R) -> bool,
        U: FnOnce(&mut R),
    {
        let mut table = self.table::<R>()?;

        // Read existing value and deserialize before mutating
        let existing_bytes = match table.get(id)? {
            Some(existing) => existing.value().to_vec(),
            None => return Ok(0),
        };

        let mut row: R = serde_json::from_slice(&existing_bytes)?;
        if !predicate(&row) {
            return Ok(0);
        }
        patch(&mut row);
        row.set_id(id);

        let json = serde_json::to_vec(&row)?;
        table.insert(id, json.as_slice())?;
        Ok(1)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, NewJob, TaskState};
    use crate::chain::SendOptions;
    use serde_json::json;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    fn sample_job(account: &str) -> TransactionJob {
        TransactionJob::new_pending(NewJob {
            account: account.to_string(),
            contract: None,
            method: "transfer(address,uint256)".to_string(),
            args: json!([]),
            opts: SendOptions::default(),
            callback: None,
        })
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let (store, _dir) = temp_store();
        let mut a = sample_job("0xaaa");
        let mut b = sample_job("0xbbb");
        assert_eq!(store.insert(&mut a).unwrap(), 1);
        assert_eq!(store.insert(&mut b).unwrap(), 2);
        assert_eq!(b.id, 2);

        let loaded: TransactionJob = store.get(2).unwrap().unwrap();
        assert_eq!(loaded.account, "0xbbb");
    }

    #[test]
    fn sequences_are_per_table() {
        let (store, _dir) = temp_store();
        let mut job = sample_job("0xaaa");
        store.insert(&mut job).unwrap();
        let mut task = TaskRecord::new("kind".into(), "name".into(), json!({}), None);
        assert_eq!(store.insert(&mut task).unwrap(), 1);
    }

    #[test]
    fn conditional_update_reports_affected_rows() {
        let (store, _dir) = temp_store();
        let mut job = sample_job("0xaaa");
        let id = store.insert(&mut job).unwrap();

        let claim = |store: &Store| {
            store
                .update::<TransactionJob, _, _>(
                    id,
                    |row| row.status == JobStatus::Pending,
                    |row| row.status = JobStatus::InFlight,
                )
                .unwrap()
        };

        assert_eq!(claim(&store), 1);
        // Second claimant loses the race
        assert_eq!(claim(&store), 0);

        let loaded: TransactionJob = store.get(id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::InFlight);
    }

    #[test]
    fn update_of_missing_row_affects_nothing() {
        let (store, _dir) = temp_store();
        let affected = store
            .update::<TransactionJob, _, _>(42, |_| true, |row| row.status = JobStatus::Failed)
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[test]
    fn select_returns_rows_in_id_order() {
        let (store, _dir) = temp_store();
        for account in ["0x3", "0x1", "0x2"] {
            let mut job = sample_job(account);
            store.insert(&mut job).unwrap();
        }
        let rows: Vec<TransactionJob> = store.select(|_| true).unwrap();
        let ids: Vec<u64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let filtered: Vec<TransactionJob> = store.select(|r: &TransactionJob| r.account == "0x1").unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn scan_skips_undecodable_rows() {
        let (store, _dir) = temp_store();
        let mut job = sample_job("0x1");
        store.insert(&mut job).unwrap();
        store.put_raw::<TransactionJob>(99, b"{not json").unwrap();

        let scan: Scan<TransactionJob> = store.scan(|_| true).unwrap();
        assert_eq!(scan.rows.len(), 1);
        assert_eq!(scan.corrupt, vec![99]);

        let rows: Vec<TransactionJob> = store.select(|_| true).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn quarantine_moves_only_undecodable_rows() {
        let (store, _dir) = temp_store();
        let mut job = sample_job("0x1");
        let id = store.insert(&mut job).unwrap();
        store.put_raw::<TransactionJob>(99, b"{not json").unwrap();

        assert!(!store.quarantine::<TransactionJob>(id).unwrap());
        assert!(!store.quarantine::<TransactionJob>(7).unwrap());
        assert!(store.quarantine::<TransactionJob>(99).unwrap());

        let scan: Scan<TransactionJob> = store.scan(|_| true).unwrap();
        assert!(scan.corrupt.is_empty());
        assert_eq!(
            store.quarantined("jobs/99").unwrap().as_deref(),
            Some(&b"{not json"[..])
        );
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (store, _dir) = temp_store();
        let result: StoreResult<()> = store.transaction(|txn| {
            let mut task = TaskRecord::new("kind".into(), "dup".into(), json!({}), None);
            txn.insert(&mut task)?;
            Err(StoreError::Conflict("abort".into()))
        });
        assert!(result.is_err());

        let rows: Vec<TaskRecord> = store.select(|_| true).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let (store, _dir) = temp_store();
        store
            .transaction(|txn| {
                let mut task = TaskRecord::new("kind".into(), "a".into(), json!({}), None);
                txn.insert(&mut task)?;
                let live: Vec<TaskRecord> =
                    txn.select(|t: &TaskRecord| t.state == TaskState::InProgress)?;
                assert_eq!(live.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
