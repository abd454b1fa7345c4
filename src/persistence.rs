//! Database persistence layer for ForgeChain
//!
//! The ledger sees storage as an ordered byte-key store with atomic read-only
//! views and read-write updates. [`SqliteStore`] backs it with a single SQLite
//! table; [`InMemoryStore`] keeps everything in a `BTreeMap` for tests and
//! ephemeral runs.

use crate::error::ChainError;
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Read access inside a store transaction.
pub trait ReadTxn {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError>;
}

/// Write access inside a store transaction.
pub trait WriteTxn: ReadTxn {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), ChainError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), ChainError>;
}

/// Abstraction for persistence backends.
///
/// `update` is all-or-nothing: if the closure returns an error none of its
/// writes become visible.
pub trait KvStore: Send + Sync {
    fn view(
        &self,
        f: &mut dyn FnMut(&dyn ReadTxn) -> Result<(), ChainError>,
    ) -> Result<(), ChainError>;

    fn update(
        &self,
        f: &mut dyn FnMut(&mut dyn WriteTxn) -> Result<(), ChainError>,
    ) -> Result<(), ChainError>;
}

impl dyn KvStore {
    /// Runs `f` in a read-only view and returns its result.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&dyn ReadTxn) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        let mut f = Some(f);
        let mut out = None;
        self.view(&mut |txn: &dyn ReadTxn| {
            if let Some(f) = f.take() {
                out = Some(f(txn)?);
            }
            Ok(())
        })?;
        out.ok_or_else(|| ChainError::DatabaseError("View closure did not run".to_string()))
    }

    /// Runs `f` in a read-write transaction and returns its result.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut dyn WriteTxn) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        let mut f = Some(f);
        let mut out = None;
        self.update(&mut |txn: &mut dyn WriteTxn| {
            if let Some(f) = f.take() {
                out = Some(f(txn)?);
            }
            Ok(())
        })?;
        out.ok_or_else(|| ChainError::DatabaseError("Update closure did not run".to_string()))
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    lock_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens (or creates) the store at `path`, holding `<path>.lock` for the
    /// lifetime of the store. A lock left behind by a dead process is removed
    /// and the open retried once.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(path);
        acquire_lock(&lock_path)?;

        let conn = match Self::open_connection(path) {
            Ok(conn) => conn,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e);
            }
        };

        Ok(SqliteStore {
            conn: Mutex::new(conn),
            lock_path: Some(lock_path),
        })
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Self::open_connection(Path::new(":memory:"))?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            lock_path: None,
        })
    }

    /// Whether a store file already exists at `path`.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().is_file()
    }

    fn open_connection(path: &Path) -> Result<Connection, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create kv table: {}", e)))?;

        Ok(conn)
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }
}

impl KvStore for SqliteStore {
    fn view(
        &self,
        f: &mut dyn FnMut(&dyn ReadTxn) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;
        f(&SqliteTxn { conn: &tx })
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut dyn WriteTxn) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
        })?;

        f(&mut SqliteTxn { conn: &tx })?;

        tx.commit().map_err(|e| {
            ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Some(lock_path) = &self.lock_path {
            if let Err(e) = fs::remove_file(lock_path) {
                warn!("Failed to release database lock {:?}: {}", lock_path, e);
            }
        }
    }
}

struct SqliteTxn<'a> {
    conn: &'a Connection,
}

impl ReadTxn for SqliteTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to read key: {}", e)))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![prefix], |row| {
                let key: Vec<u8> = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                Ok((key, value))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to scan keys: {}", e)))?;

        let mut pairs = Vec::new();
        for row in rows {
            let (key, value) =
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            if !key.starts_with(prefix) {
                break;
            }
            pairs.push((key, value));
        }
        Ok(pairs)
    }
}

impl WriteTxn for SqliteTxn<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to write key: {}", e)))?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), ChainError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to delete key: {}", e)))?;
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_lock(lock_path: &Path) -> Result<(), ChainError> {
    match create_lock_file(lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            warn!("Found stale database lock {:?}, removing it", lock_path);
            fs::remove_file(lock_path).map_err(|e| {
                ChainError::DatabaseLocked(format!("removing {:?}: {}", lock_path, e))
            })?;
            create_lock_file(lock_path).map_err(|e| {
                ChainError::DatabaseLocked(format!("could not unlock {:?}: {}", lock_path, e))
            })?;
            info!("Database unlocked");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn create_lock_file(lock_path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    writeln!(file, "{}", std::process::id())
}

/// Simple in-memory store useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

struct MemTxn<'a> {
    data: &'a BTreeMap<Vec<u8>, Vec<u8>>,
}

struct MemWriteTxn {
    staged: BTreeMap<Vec<u8>, Vec<u8>>,
}

fn scan_map(
    data: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    data.range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl ReadTxn for MemTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        Ok(scan_map(self.data, prefix))
    }
}

impl ReadTxn for MemWriteTxn {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.staged.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        Ok(scan_map(&self.staged, prefix))
    }
}

impl WriteTxn for MemWriteTxn {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        self.staged.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), ChainError> {
        self.staged.remove(key);
        Ok(())
    }
}

impl KvStore for InMemoryStore {
    fn view(
        &self,
        f: &mut dyn FnMut(&dyn ReadTxn) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let data = self.data.read();
        f(&MemTxn { data: &data })
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut dyn WriteTxn) -> Result<(), ChainError>,
    ) -> Result<(), ChainError> {
        let mut data = self.data.write();
        let mut txn = MemWriteTxn {
            staged: data.clone(),
        };
        f(&mut txn)?;
        *data = txn.staged;
        Ok(())
    }
}
