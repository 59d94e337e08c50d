//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDateTime;
use edgelease::storage::{InstanceFilter, InstancePatch};
use edgelease::{
    Instance, LeaseError, MemoryStore, Result, SiteId, Store, Transaction, UsageRecord, ZoneId,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Parks one `insert_record` for a site until released.
pub struct HeldInsert {
    site: SiteId,
    reached: Notify,
    release: Notify,
}

impl HeldInsert {
    /// Resolves once the insert is parked.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Switches for `FaultyStore`.
#[derive(Default)]
pub struct Faults {
    insert_record: AtomicBool,
    broken_zones: Mutex<HashSet<String>>,
    held_insert: Mutex<Option<Arc<HeldInsert>>>,
}

impl Faults {
    pub fn fail_record_inserts(&self, fail: bool) {
        self.insert_record.store(fail, Ordering::SeqCst);
    }

    pub fn break_zone(&self, zone: &ZoneId) {
        self.broken_zones.lock().unwrap().insert(zone.to_string());
    }

    /// Park the next record insert for `site`. Fires once.
    pub fn hold_record_insert(&self, site: &SiteId) -> Arc<HeldInsert> {
        let held = Arc::new(HeldInsert {
            site: site.clone(),
            reached: Notify::new(),
            release: Notify::new(),
        });
        *self.held_insert.lock().unwrap() = Some(Arc::clone(&held));
        held
    }

    fn take_held_insert(&self, site: &SiteId) -> Option<Arc<HeldInsert>> {
        let mut slot = self.held_insert.lock().unwrap();
        if slot.as_ref().is_some_and(|held| &held.site == site) {
            slot.take()
        } else {
            None
        }
    }

    fn zone_broken(&self, zone: &ZoneId) -> bool {
        self.broken_zones.lock().unwrap().contains(zone.as_str())
    }
}

/// `MemoryStore` wrapper that fails selected statements on demand.
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Arc<Faults>,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> (Arc<Self>, Arc<Faults>) {
        let faults = Arc::new(Faults::default());
        let store = Arc::new(Self {
            inner,
            faults: Arc::clone(&faults),
        });
        (store, faults)
    }
}

struct FaultyTransaction {
    inner: Box<dyn Transaction>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Store for FaultyStore {
    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_tables(prefix).await
    }

    async fn create_zone(&self, zone: &ZoneId) -> Result<()> {
        self.inner.create_zone(zone).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

#[async_trait]
impl Transaction for FaultyTransaction {
    async fn select_instances(&mut self, zone: &ZoneId, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        self.inner.select_instances(zone, filter).await
    }

    async fn count_instances(&mut self, zone: &ZoneId, filter: &InstanceFilter) -> Result<u64> {
        self.inner.count_instances(zone, filter).await
    }

    async fn distinct_sites(&mut self, zone: &ZoneId) -> Result<BTreeSet<SiteId>> {
        if self.faults.zone_broken(zone) {
            return Err(LeaseError::store(format!("injected scan failure for {}", zone)));
        }
        self.inner.distinct_sites(zone).await
    }

    async fn insert_instance(&mut self, zone: &ZoneId, instance: Instance) -> Result<()> {
        self.inner.insert_instance(zone, instance).await
    }

    async fn update_instances(
        &mut self,
        zone: &ZoneId,
        filter: &InstanceFilter,
        patch: &InstancePatch,
    ) -> Result<u64> {
        self.inner.update_instances(zone, filter, patch).await
    }

    async fn select_records(&mut self, zone: &ZoneId, site: &SiteId) -> Result<Vec<UsageRecord>> {
        self.inner.select_records(zone, site).await
    }

    async fn count_records(&mut self, zone: &ZoneId, site: &SiteId) -> Result<u64> {
        self.inner.count_records(zone, site).await
    }

    async fn delete_oldest_record(&mut self, zone: &ZoneId, site: &SiteId) -> Result<u64> {
        self.inner.delete_oldest_record(zone, site).await
    }

    async fn insert_record(&mut self, record: UsageRecord) -> Result<()> {
        if self.faults.insert_record.load(Ordering::SeqCst) {
            return Err(LeaseError::store("injected insert failure"));
        }
        let held = self.faults.take_held_insert(&record.site);
        if let Some(held) = held {
            held.reached.notify_one();
            held.release.notified().await;
        }
        self.inner.insert_record(record).await
    }

    async fn latest_record(&mut self, zone: &ZoneId) -> Result<Option<NaiveDateTime>> {
        self.inner.latest_record(zone).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

/// Create `zone` with `pinned` instances per site plus `elastic` unassigned ones.
pub async fn provision_zone(
    store: &dyn Store,
    zone: &str,
    sites: &[&str],
    pinned: usize,
    elastic: usize,
) -> ZoneId {
    let zone = ZoneId::parse(zone).unwrap();
    store.create_zone(&zone).await.unwrap();
    let mut tx = store.begin().await.unwrap();
    for site in sites {
        for n in 0..pinned {
            tx.insert_instance(
                &zone,
                Instance::pinned(
                    zone.clone(),
                    SiteId::parse(site).unwrap(),
                    format!("{}-{}-{}", zone, site, n),
                    "10.2.0.1",
                    format!("pod-{}-{}", site, n),
                    8000,
                ),
            )
            .await
            .unwrap();
        }
    }
    for n in 0..elastic {
        tx.insert_instance(
            &zone,
            Instance::elastic(zone.clone(), format!("{}-elastic-{}", zone, n), "10.2.0.9", "pod-elastic", 8000),
        )
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
    zone
}
