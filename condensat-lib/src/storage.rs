//! Durable storage behind a narrow key/value interface.
//!
//! Services only see the [`Storage`] trait: named tables of string keys and
//! byte values, created by [`Storage::migrate`], with upsert, point lookup and
//! prefix queries. [`RedbStorage`] implements it on top of redb.

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Database operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table not found: {table}")]
    TableNotFound { table: String },
}

/// Schema entry applied by [`Storage::migrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescriptor {
    /// Table name
    pub name: &'static str,
    /// What the table holds
    pub description: &'static str,
}

/// Tables used by Condensat services.
pub struct Tables;

impl Tables {
    /// Process-info samples keyed by `app/host/timestamp`
    pub const PROCESS_INFO: TableDescriptor = TableDescriptor {
        name: "process_info",
        description: "process-info samples keyed by app, host and timestamp",
    };

    /// Log entries keyed by ordering token
    pub const LOGS: TableDescriptor = TableDescriptor {
        name: "logs",
        description: "log entries keyed by ordering token",
    };

    /// Every table
    pub fn all() -> Vec<TableDescriptor> {
        vec![Self::PROCESS_INFO, Self::LOGS]
    }
}

/// Narrow write/query interface to durable storage.
pub trait Storage: Send + Sync {
    /// Create missing tables.
    fn migrate(&self, tables: &[TableDescriptor]) -> Result<(), StorageError>;

    /// Insert or replace a value.
    fn upsert(&self, table: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Fetch a value.
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries whose key starts with `prefix`, ascending by key.
    fn query(&self, table: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Remove a value; returns whether it existed.
    fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError>;
}

/// JSON helpers available on every [`Storage`].
pub trait StorageExt: Storage {
    /// Serialize and upsert a value.
    fn upsert_json<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.upsert(table, key, &bytes)
    }

    /// Fetch and deserialize a value.
    fn get_json<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>, StorageError> {
        self.get(table, key)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            .transpose()
    }

    /// Query by prefix and deserialize every value.
    fn query_json<T: DeserializeOwned>(&self, table: &str, prefix: &str) -> Result<Vec<T>, StorageError> {
        self.query(table, prefix)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(StorageError::from))
            .collect()
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

fn table_definition(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// redb-backed [`Storage`].
pub struct RedbStorage {
    db: Database,
    tables: RwLock<BTreeSet<String>>,
}

impl RedbStorage {
    /// Create or open a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        info!(path = %path.display(), "Storage opened");
        Ok(Self {
            db,
            tables: RwLock::new(BTreeSet::new()),
        })
    }

    fn ensure_known(&self, table: &str) -> Result<(), StorageError> {
        let known = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(table);
        if known {
            Ok(())
        } else {
            Err(StorageError::TableNotFound {
                table: table.to_owned(),
            })
        }
    }
}

impl Storage for RedbStorage {
    fn migrate(&self, tables: &[TableDescriptor]) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        for table in tables {
            write_txn.open_table(table_definition(table.name))?;
            debug!(table = table.name, description = table.description, "Table ready");
        }
        write_txn.commit()?;

        let mut known = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        known.extend(tables.iter().map(|t| t.name.to_owned()));
        Ok(())
    }

    fn upsert(&self, table: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.ensure_known(table)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut handle = write_txn.open_table(table_definition(table))?;
            handle.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_known(table)?;
        let read_txn = self.db.begin_read()?;
        let handle = read_txn.open_table(table_definition(table))?;
        Ok(handle.get(key)?.map(|value| value.value().to_vec()))
    }

    fn query(&self, table: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.ensure_known(table)?;
        let read_txn = self.db.begin_read()?;
        let handle = read_txn.open_table(table_definition(table))?;

        let mut rows = Vec::new();
        for entry in handle.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_owned(), value.value().to_vec()));
        }
        Ok(rows)
    }

    fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        self.ensure_known(table)?;
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut handle = write_txn.open_table(table_definition(table))?;
            handle.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }
}
