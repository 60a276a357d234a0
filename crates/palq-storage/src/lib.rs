//! Tabular storage backends and the document lock for the relocation queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use palq_core::{Cell, CellRef, CellUpdate, Table};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

mod lock;

pub use lock::{DocumentLock, FileLock, LockGuard, MemoryLock};

pub const CRATE_NAME: &str = "palq-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table `{0}` not found")]
    TableNotFound(String),
    #[error("row {row} out of range for table `{table}` ({len} data rows)")]
    RowOutOfRange { table: String, row: usize, len: usize },
    #[error("invalid table name `{0}`")]
    InvalidTableName(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Row/cell access to a document made of named tables.
///
/// Row indices address data rows (0-based, header excluded). Every batch
/// method validates all positions before changing anything.
#[async_trait]
pub trait TabularStore: Send + Sync {
    /// `None` when the table does not exist.
    async fn read_table(&self, name: &str) -> Result<Option<Table>, StoreError>;

    /// Destructive overwrite; creates the table if needed.
    async fn write_table(
        &self,
        name: &str,
        header: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<(), StoreError>;

    async fn delete_row(&self, name: &str, index: usize) -> Result<(), StoreError>;

    /// Writes many cells, each with its own value, as one atomic step.
    async fn batch_update(&self, name: &str, updates: &[CellUpdate]) -> Result<(), StoreError>;

    async fn set_cell(&self, name: &str, at: CellRef, value: Cell) -> Result<(), StoreError> {
        self.batch_update(name, &[CellUpdate { at, value }]).await
    }

    async fn batch_clear(&self, name: &str, cells: &[CellRef]) -> Result<(), StoreError> {
        self.batch_set(name, cells, Cell::Empty).await
    }

    async fn batch_set(
        &self,
        name: &str,
        cells: &[CellRef],
        value: Cell,
    ) -> Result<(), StoreError> {
        let updates = cells
            .iter()
            .map(|&at| CellUpdate {
                at,
                value: value.clone(),
            })
            .collect::<Vec<_>>();
        self.batch_update(name, &updates).await
    }
}

fn apply_updates(name: &str, table: &mut Table, updates: &[CellUpdate]) -> Result<(), StoreError> {
    let len = table.rows.len();
    if let Some(bad) = updates.iter().find(|u| u.at.row >= len) {
        return Err(StoreError::RowOutOfRange {
            table: name.to_string(),
            row: bad.at.row,
            len,
        });
    }
    for update in updates {
        table.set(update.at, update.value.clone());
    }
    Ok(())
}

fn remove_row(name: &str, table: &mut Table, index: usize) -> Result<(), StoreError> {
    if index >= table.rows.len() {
        return Err(StoreError::RowOutOfRange {
            table: name.to_string(),
            row: index,
            len: table.rows.len(),
        });
    }
    table.rows.remove(index);
    Ok(())
}

/// Process-local store, used by tests and by embedders that persist elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<String, Table>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = (S, Table)>,
        S: Into<String>,
    {
        let tables = tables.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            tables: Arc::new(Mutex::new(tables)),
        }
    }

    pub async fn insert(&self, name: &str, table: Table) {
        self.tables.lock().await.insert(name.to_string(), table);
    }

    pub async fn remove(&self, name: &str) -> Option<Table> {
        self.tables.lock().await.remove(name)
    }
}

#[async_trait]
impl TabularStore for MemoryStore {
    async fn read_table(&self, name: &str) -> Result<Option<Table>, StoreError> {
        Ok(self.tables.lock().await.get(name).cloned())
    }

    async fn write_table(
        &self,
        name: &str,
        header: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .insert(name.to_string(), Table::new(header.to_vec(), rows.to_vec()));
        Ok(())
    }

    async fn delete_row(&self, name: &str, index: usize) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
        remove_row(name, table, index)
    }

    async fn batch_update(&self, name: &str, updates: &[CellUpdate]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
        apply_updates(name, table, updates)
    }
}

/// Directory of JSON table files, one `<name>.json` per table.
///
/// Every write goes through a temp file and an atomic rename, so readers see
/// either the old or the new table. Rewrites with identical content are
/// skipped.
#[derive(Debug)]
pub struct WorkbookStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkbookStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn table_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidTableName(name.to_string()));
        }
        Ok(self.root.join(format!("{name}.json")))
    }

    async fn load(&self, name: &str) -> Result<Option<Table>, StoreError> {
        let path = self.table_path(name)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading table file {}", path.display()))
                    .into())
            }
        };
        let table = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing table file {}", path.display()))?;
        Ok(Some(table))
    }

    async fn load_existing(&self, name: &str) -> Result<Table, StoreError> {
        self.load(name)
            .await?
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    /// Returns `false` when the file already held identical content.
    async fn persist(&self, name: &str, table: &Table) -> Result<bool, StoreError> {
        let path = self.table_path(name)?;
        let bytes = serde_json::to_vec_pretty(table)
            .with_context(|| format!("serializing table `{name}`"))?;

        if let Ok(existing) = fs::read(&path).await {
            if Self::sha256_hex(&existing) == Self::sha256_hex(&bytes) {
                debug!(table = name, "table content unchanged; skipping rewrite");
                return Ok(false);
            }
        }

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating workbook directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{name}.{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp table file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp table file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp table file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::new(err)
                .context(format!(
                    "atomically renaming temp table {} -> {}",
                    temp_path.display(),
                    path.display()
                ))
                .into());
        }
        Ok(true)
    }
}

#[async_trait]
impl TabularStore for WorkbookStore {
    async fn read_table(&self, name: &str) -> Result<Option<Table>, StoreError> {
        self.load(name).await
    }

    async fn write_table(
        &self,
        name: &str,
        header: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let table = Table::new(header.to_vec(), rows.to_vec());
        self.persist(name, &table).await?;
        Ok(())
    }

    async fn delete_row(&self, name: &str, index: usize) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut table = self.load_existing(name).await?;
        remove_row(name, &mut table, index)?;
        self.persist(name, &table).await?;
        Ok(())
    }

    async fn batch_update(&self, name: &str, updates: &[CellUpdate]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut table = self.load_existing(name).await?;
        apply_updates(name, &mut table, updates)?;
        self.persist(name, &table).await?;
        Ok(())
    }
}
