use super::catalog::{instance_table, record_table};
use super::change::{Change, Replay};
use super::engine::{InstanceFilter, InstancePatch, Store, Transaction};
use super::persistence::{DurabilityMode, PersistenceManager, TableSet, WalEntry};
use super::table::{InstanceTable, RecordTable};
use crate::core::{Instance, LeaseError, Result, SiteId, UsageRecord, ZoneId};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

type SharedInstances = Arc<RwLock<InstanceTable>>;
type SharedRecords = Arc<RwLock<RecordTable>>;
type InstanceGuards = HashMap<String, OwnedRwLockWriteGuard<InstanceTable>>;
type RecordGuards = HashMap<String, OwnedRwLockWriteGuard<RecordTable>>;

/// In-memory relational store with optional WAL + snapshot durability.
///
/// Every table sits behind its own lock. A transaction write-locks a table the
/// first time it touches it and keeps the lock until commit or rollback, so
/// transactions on the same partition run one at a time. Transactions are
/// expected to touch a single partition table.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    instances: RwLock<HashMap<String, SharedInstances>>,
    records: RwLock<HashMap<String, SharedRecords>>,
    persistence: Option<Mutex<PersistenceManager>>,
    next_tx_id: AtomicU64,
}

impl MemoryStore {
    /// A store that keeps nothing on disk.
    pub fn new() -> Self {
        Self::from_tables(TableSet::default(), None)
    }

    /// Open (or create) a durable store in `data_dir`, replaying the last
    /// snapshot and the WAL.
    pub fn open<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let persistence = PersistenceManager::new(data_dir.as_ref(), durability_mode)?;
        let tables = persistence.recover()?.unwrap_or_default();
        info!(
            data_dir = %data_dir.as_ref().display(),
            tables = tables.table_count(),
            rows = tables.row_count(),
            "Store recovered"
        );
        Ok(Self::from_tables(tables, Some(persistence)))
    }

    fn from_tables(tables: TableSet, persistence: Option<PersistenceManager>) -> Self {
        let instances = tables
            .instances
            .into_iter()
            .map(|(name, table)| (name, Arc::new(RwLock::new(table))))
            .collect();
        let records = tables
            .records
            .into_iter()
            .map(|(name, table)| (name, Arc::new(RwLock::new(table))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                instances: RwLock::new(instances),
                records: RwLock::new(records),
                persistence: persistence.map(Mutex::new),
                next_tx_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.inner.persistence.is_some()
    }

    /// Write a full snapshot and truncate the WAL.
    ///
    /// Holds read locks on every table while copying, so the snapshot and the
    /// truncation agree on which commits are included.
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(persistence) = &self.inner.persistence else {
            return Ok(());
        };

        let instance_map = self.inner.instances.read().await;
        let record_map = self.inner.records.read().await;

        let mut names: Vec<&String> = instance_map.keys().collect();
        names.sort();
        let mut instance_guards = Vec::with_capacity(names.len());
        for name in names {
            instance_guards.push((name.clone(), instance_map[name].clone().read_owned().await));
        }
        let mut names: Vec<&String> = record_map.keys().collect();
        names.sort();
        let mut record_guards = Vec::with_capacity(names.len());
        for name in names {
            record_guards.push((name.clone(), record_map[name].clone().read_owned().await));
        }

        let tables = TableSet {
            instances: instance_guards
                .iter()
                .map(|(name, guard)| (name.clone(), (**guard).clone()))
                .collect(),
            records: record_guards
                .iter()
                .map(|(name, guard)| (name.clone(), (**guard).clone()))
                .collect(),
        };
        let rows = tables.row_count();

        let wal_entries = persistence.lock().await.checkpoint(tables)?;
        info!(rows, wal_entries, "Checkpoint written");
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    async fn instance_handle(&self, name: &str) -> Result<SharedInstances> {
        self.instances
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LeaseError::TableNotFound(name.to_string()))
    }

    async fn record_handle(&self, name: &str) -> Result<SharedRecords> {
        self.records
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LeaseError::TableNotFound(name.to_string()))
    }

    async fn log(&self, entry: &WalEntry) -> Result<()> {
        match &self.persistence {
            Some(persistence) => persistence.lock().await.log(entry),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .inner
            .instances
            .read()
            .await
            .keys()
            .chain(self.inner.records.read().await.keys())
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_zone(&self, zone: &ZoneId) -> Result<()> {
        let instances_name = instance_table(zone);
        let records_name = record_table(zone);

        let mut instances = self.inner.instances.write().await;
        let mut records = self.inner.records.write().await;
        if instances.contains_key(&instances_name) {
            return Err(LeaseError::TableExists(instances_name));
        }
        if records.contains_key(&records_name) {
            return Err(LeaseError::TableExists(records_name));
        }

        self.inner.log(&WalEntry::CreateZone(zone.clone())).await?;

        instances.insert(
            instances_name.clone(),
            Arc::new(RwLock::new(InstanceTable::new(instances_name))),
        );
        records.insert(
            records_name.clone(),
            Arc::new(RwLock::new(RecordTable::new(records_name))),
        );
        info!(zone = %zone, "Zone partition created");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let id = self.inner.next_tx_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            id,
            inner: Arc::clone(&self.inner),
            instance_guards: HashMap::new(),
            record_guards: HashMap::new(),
            changes: Vec::new(),
            finished: false,
        }))
    }
}

pub struct MemoryTransaction {
    id: u64,
    inner: Arc<Inner>,
    instance_guards: InstanceGuards,
    record_guards: RecordGuards,
    changes: Vec<Change>,
    finished: bool,
}

async fn lock_instances<'a>(
    inner: &Inner,
    guards: &'a mut InstanceGuards,
    zone: &ZoneId,
) -> Result<&'a mut InstanceTable> {
    let guard = match guards.entry(instance_table(zone)) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            let handle = inner.instance_handle(entry.key()).await?;
            entry.insert(handle.write_owned().await)
        }
    };
    Ok(&mut **guard)
}

async fn lock_records<'a>(
    inner: &Inner,
    guards: &'a mut RecordGuards,
    zone: &ZoneId,
) -> Result<&'a mut RecordTable> {
    let guard = match guards.entry(record_table(zone)) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            let handle = inner.record_handle(entry.key()).await?;
            entry.insert(handle.write_owned().await)
        }
    };
    Ok(&mut **guard)
}

impl MemoryTransaction {
    fn undo_all(&mut self) {
        for change in self.changes.drain(..).rev() {
            let name = change.table_name().to_string();
            if let Some(guard) = self.instance_guards.get_mut(&name) {
                guard.undo(&change);
            } else if let Some(guard) = self.record_guards.get_mut(&name) {
                guard.undo(&change);
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn select_instances(
        &mut self,
        zone: &ZoneId,
        filter: &InstanceFilter,
    ) -> Result<Vec<Instance>> {
        let table = lock_instances(&self.inner, &mut self.instance_guards, zone).await?;
        Ok(table
            .scan_with_ids(|row| filter.matches(row))
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    async fn count_instances(&mut self, zone: &ZoneId, filter: &InstanceFilter) -> Result<u64> {
        let table = lock_instances(&self.inner, &mut self.instance_guards, zone).await?;
        Ok(table.iter().filter(|(_, row)| filter.matches(row)).count() as u64)
    }

    async fn distinct_sites(&mut self, zone: &ZoneId) -> Result<BTreeSet<SiteId>> {
        let table = lock_instances(&self.inner, &mut self.instance_guards, zone).await?;
        Ok(table.iter().filter_map(|(_, row)| row.site.clone()).collect())
    }

    async fn insert_instance(&mut self, zone: &ZoneId, instance: Instance) -> Result<()> {
        if &instance.zone != zone {
            return Err(LeaseError::InvalidInstance(format!(
                "instance '{}' belongs to zone '{}', not '{}'",
                instance.instance_id, instance.zone, zone
            )));
        }
        instance.validate()?;

        let table = lock_instances(&self.inner, &mut self.instance_guards, zone).await?;
        if table
            .iter()
            .any(|(_, row)| row.instance_id == instance.instance_id)
        {
            return Err(LeaseError::DuplicateInstance {
                zone: zone.to_string(),
                instance_id: instance.instance_id,
            });
        }
        let row_id = table.insert(instance.clone());
        self.changes.push(Change::InsertInstance {
            table: table.name().to_string(),
            row_id,
            row: instance,
        });
        Ok(())
    }

    async fn update_instances(
        &mut self,
        zone: &ZoneId,
        filter: &InstanceFilter,
        patch: &InstancePatch,
    ) -> Result<u64> {
        let table = lock_instances(&self.inner, &mut self.instance_guards, zone).await?;
        let matched = table.scan_with_ids(|row| filter.matches(row));
        let mut touched = 0;
        for (row_id, old_row) in matched {
            let mut new_row = old_row.clone();
            patch.apply(&mut new_row);
            new_row.validate()?;
            table.update(row_id, new_row.clone());
            self.changes.push(Change::UpdateInstance {
                table: table.name().to_string(),
                row_id,
                old_row,
                new_row,
            });
            touched += 1;
        }
        Ok(touched)
    }

    async fn select_records(&mut self, zone: &ZoneId, site: &SiteId) -> Result<Vec<UsageRecord>> {
        let table = lock_records(&self.inner, &mut self.record_guards, zone).await?;
        let mut rows = table.scan_with_ids(|row| &row.site == site);
        rows.sort_by(|(a_id, a), (b_id, b)| a.timestamp.cmp(&b.timestamp).then(a_id.cmp(b_id)));
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    async fn count_records(&mut self, zone: &ZoneId, site: &SiteId) -> Result<u64> {
        let table = lock_records(&self.inner, &mut self.record_guards, zone).await?;
        Ok(table.iter().filter(|(_, row)| &row.site == site).count() as u64)
    }

    async fn delete_oldest_record(&mut self, zone: &ZoneId, site: &SiteId) -> Result<u64> {
        let table = lock_records(&self.inner, &mut self.record_guards, zone).await?;
        let oldest = table
            .iter()
            .filter(|(_, row)| &row.site == site)
            .min_by(|(a_id, a), (b_id, b)| a.timestamp.cmp(&b.timestamp).then(a_id.cmp(b_id)))
            .map(|(row_id, _)| row_id);

        let Some(row_id) = oldest else {
            return Ok(0);
        };
        let Some(old_row) = table.delete(row_id) else {
            return Ok(0);
        };
        self.changes.push(Change::DeleteRecord {
            table: table.name().to_string(),
            row_id,
            old_row,
        });
        Ok(1)
    }

    async fn insert_record(&mut self, record: UsageRecord) -> Result<()> {
        let zone = record.zone.clone();
        let table = lock_records(&self.inner, &mut self.record_guards, &zone).await?;
        let row_id = table.insert(record.clone());
        self.changes.push(Change::InsertRecord {
            table: table.name().to_string(),
            row_id,
            row: record,
        });
        Ok(())
    }

    async fn latest_record(&mut self, zone: &ZoneId) -> Result<Option<NaiveDateTime>> {
        let table = lock_records(&self.inner, &mut self.record_guards, zone).await?;
        Ok(table.iter().map(|(_, row)| row.timestamp).max())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if !self.changes.is_empty() {
            let entry = WalEntry::Commit {
                tx_id: self.id,
                changes: self.changes.clone(),
            };
            if let Err(err) = self.inner.log(&entry).await {
                warn!(tx_id = self.id, error = %err, "WAL append failed, rolling back");
                self.undo_all();
                self.finished = true;
                return Err(err);
            }
        }
        debug!(tx_id = self.id, changes = self.changes.len(), "Transaction committed");
        self.changes.clear();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        debug!(tx_id = self.id, changes = self.changes.len(), "Transaction rolled back");
        self.undo_all();
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.changes.is_empty() {
            debug!(tx_id = self.id, "Uncommitted transaction dropped, rolling back");
            self.undo_all();
        }
    }
}
