//! Write-ahead logging and snapshots for the in-memory store

use super::change::{Change, Replay};
use super::table::{InstanceTable, RecordTable};
use crate::core::{LeaseError, Result, ZoneId};
use super::catalog::{TableKind, instance_table, record_table};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

// ============================================================================
// WAL Entry Types
// ============================================================================

/// One WAL entry per DDL statement or committed transaction.
///
/// A transaction's changes travel in a single entry, so replay sees either
/// all of them or none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    CreateZone(ZoneId),
    Commit { tx_id: u64, changes: Vec<Change> },
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSet {
    pub instances: HashMap<String, InstanceTable>,
    pub records: HashMap<String, RecordTable>,
}

impl TableSet {
    pub fn create_zone(&mut self, zone: &ZoneId) {
        let instances = instance_table(zone);
        let records = record_table(zone);
        self.instances
            .entry(instances.clone())
            .or_insert_with(|| InstanceTable::new(instances));
        self.records
            .entry(records.clone())
            .or_insert_with(|| RecordTable::new(records));
    }

    pub fn redo(&mut self, change: &Change) {
        let applied = match change.kind() {
            TableKind::Instance => self
                .instances
                .get_mut(change.table_name())
                .map(|table| table.redo(change))
                .is_some(),
            TableKind::Record => self
                .records
                .get_mut(change.table_name())
                .map(|table| table.redo(change))
                .is_some(),
        };
        if !applied {
            warn!(table = change.table_name(), "WAL change for unknown table skipped");
        }
    }

    pub fn row_count(&self) -> usize {
        self.instances.values().map(|t| t.row_count()).sum::<usize>()
            + self.records.values().map(|t| t.row_count()).sum::<usize>()
    }

    pub fn table_count(&self) -> usize {
        self.instances.len() + self.records.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub tables: TableSet,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: u64,
    pub row_count: usize,
    pub table_count: usize,
}

impl StoreSnapshot {
    pub fn new(tables: TableSet) -> Self {
        let row_count = tables.row_count();
        let table_count = tables.table_count();
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            version: 1,
            tables,
            metadata: SnapshotMetadata {
                created_at,
                row_count,
                table_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every committed transaction.
    #[default]
    Sync,
    /// Flush to the OS after every commit, no fsync.
    Async,
    /// Keep nothing on disk.
    None,
}

impl FromStr for DurabilityMode {
    type Err = LeaseError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "none" | "off" => Ok(Self::None),
            other => Err(LeaseError::persistence(format!(
                "unknown durability mode '{}', expected sync, async or none",
                other
            ))),
        }
    }
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
}

/// Result of scanning the WAL: every complete entry and the byte length they
/// occupy. Anything past `valid_len` is a torn append.
struct WalScan {
    entries: Vec<WalEntry>,
    valid_len: u64,
}

impl WalManager {
    /// Open the WAL for appending. A torn tail left by a crash is cut off
    /// first so new entries start on an entry boundary.
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LeaseError::persistence(format!("Failed to create WAL directory: {}", e))
            })?;
        }

        let wal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| LeaseError::persistence(format!("Failed to open WAL file: {}", e)))?;
            let file_len = file
                .metadata()
                .map_err(|e| LeaseError::persistence(format!("Failed to stat WAL file: {}", e)))?
                .len();
            let valid_len = Self::scan(&wal_path)?.valid_len;
            if valid_len < file_len {
                warn!(
                    path = %wal_path.display(),
                    dropped_bytes = file_len - valid_len,
                    "Truncating torn WAL tail"
                );
                file.set_len(valid_len).map_err(|e| {
                    LeaseError::persistence(format!("Failed to truncate torn WAL tail: {}", e))
                })?;
            }
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
        })
    }

    /// Append one entry. On failure the file is cut back to its length before
    /// the append, so a partial entry never precedes later ones.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let serialized = rmp_serde::to_vec(entry).map_err(|e| {
            LeaseError::persistence(format!("Failed to serialize WAL entry: {}", e))
        })?;
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| LeaseError::persistence("WAL file not initialized"))?;
        let committed_len = file
            .get_ref()
            .metadata()
            .map_err(|e| LeaseError::persistence(format!("Failed to stat WAL file: {}", e)))?
            .len();

        if let Err(err) = Self::write_entry(file, &serialized, self.durability_mode) {
            if let Err(truncate_err) = self.truncate_to(committed_len) {
                warn!(
                    path = %self.wal_path.display(),
                    error = %truncate_err,
                    "Could not remove partial WAL entry"
                );
            }
            return Err(err);
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    fn write_entry(
        file: &mut BufWriter<File>,
        serialized: &[u8],
        durability_mode: DurabilityMode,
    ) -> Result<()> {
        let len = serialized.len() as u32;
        file.write_all(&len.to_le_bytes())
            .map_err(|e| LeaseError::persistence(format!("Failed to write WAL: {}", e)))?;
        file.write_all(serialized)
            .map_err(|e| LeaseError::persistence(format!("Failed to write WAL: {}", e)))?;
        file.flush()
            .map_err(|e| LeaseError::persistence(format!("Failed to flush WAL: {}", e)))?;
        if durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| LeaseError::persistence(format!("Failed to sync WAL: {}", e)))?;
        }
        Ok(())
    }

    /// Drop buffered bytes without flushing them and cut the file to `len`.
    /// The writer stays closed if truncation fails, so later appends error.
    fn truncate_to(&mut self, len: u64) -> Result<()> {
        let Some(writer) = self.wal_file.take() else {
            return Ok(());
        };
        let (mut file, _unwritten) = writer.into_parts();
        file.set_len(len)
            .map_err(|e| LeaseError::persistence(format!("Failed to truncate WAL: {}", e)))?;
        file.seek(SeekFrom::Start(len))
            .map_err(|e| LeaseError::persistence(format!("Failed to seek WAL: {}", e)))?;
        self.wal_file = Some(BufWriter::new(file));
        Ok(())
    }

    /// Read every complete entry. A torn final entry (crash mid-append) is dropped.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        Ok(Self::scan(&self.wal_path)?.entries)
    }

    fn scan(wal_path: &Path) -> Result<WalScan> {
        if !wal_path.exists() {
            return Ok(WalScan {
                entries: Vec::new(),
                valid_len: 0,
            });
        }
        let file = File::open(wal_path).map_err(|e| {
            LeaseError::persistence(format!("Failed to open WAL for reading: {}", e))
        })?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = 0u64;
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(LeaseError::persistence(format!(
                        "Failed to read WAL entry length: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(
                        path = %wal_path.display(),
                        entries = entries.len(),
                        "Ignoring torn WAL tail"
                    );
                    break;
                }
                Err(e) => {
                    return Err(LeaseError::persistence(format!(
                        "Failed to read WAL entry data: {}",
                        e
                    )));
                }
            }
            let entry: WalEntry = rmp_serde::from_slice(&data).map_err(|e| {
                LeaseError::persistence(format!("Failed to deserialize WAL entry: {}", e))
            })?;
            entries.push(entry);
            valid_len += 4 + len as u64;
        }
        Ok(WalScan { entries, valid_len })
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| LeaseError::persistence(format!("Failed to truncate WAL: {}", e)))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Write to a temp file in the same directory, fsync, then rename over the
    /// previous snapshot.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir).map_err(|e| {
            LeaseError::persistence(format!("Failed to create snapshot directory: {}", e))
        })?;
        let serialized = rmp_serde::to_vec(snapshot)
            .map_err(|e| LeaseError::persistence(format!("Failed to serialize snapshot: {}", e)))?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| LeaseError::persistence(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| LeaseError::persistence(format!("Failed to write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| LeaseError::persistence(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| LeaseError::persistence(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| LeaseError::persistence(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| LeaseError::persistence(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            LeaseError::persistence(format!("Failed to deserialize snapshot: {}", e))
        })?;
        Ok(Some(snapshot))
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join("edgelease.wal"), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join("edgelease.snapshot"));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    /// Snapshot `tables` and truncate the WAL. Returns how many WAL entries
    /// the snapshot absorbed.
    pub fn checkpoint(&mut self, tables: TableSet) -> Result<usize> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(0);
        }
        let absorbed = self.wal.entries_since_checkpoint();
        self.snapshot.save(&StoreSnapshot::new(tables))?;
        self.wal.clear()?;
        Ok(absorbed)
    }

    /// Load the last snapshot and replay the WAL on top of it.
    pub fn recover(&self) -> Result<Option<TableSet>> {
        let snapshot = self.snapshot.load()?;
        let entries = self.wal.read_all()?;
        if snapshot.is_none() && entries.is_empty() {
            return Ok(None);
        }

        let mut tables = snapshot.map(|s| s.tables).unwrap_or_default();
        for entry in entries {
            match entry {
                WalEntry::CreateZone(zone) => tables.create_zone(&zone),
                WalEntry::Commit { changes, .. } => {
                    for change in &changes {
                        tables.redo(change);
                    }
                }
            }
        }
        Ok(Some(tables))
    }
}
