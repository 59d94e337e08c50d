use crate::core::{DeviceId, Instance, InstanceStatus, Result, SiteId, UsageRecord, ZoneId};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::BTreeSet;

/// Relational store backing the per-zone partitions.
///
/// Every read and write goes through a [`Transaction`]; single statements are
/// simply one-statement transactions. Implementations must roll back a
/// transaction that is dropped without `commit`.
#[async_trait]
pub trait Store: Send + Sync {
    /// List table names starting with `prefix`.
    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create the `instance_<zone>` and `record_<zone>` tables.
    async fn create_zone(&self, zone: &ZoneId) -> Result<()>;

    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Typed statements against one zone's partition.
///
/// Table names are derived from the `ZoneId` argument; filters and patches
/// carry values only.
#[async_trait]
pub trait Transaction: Send {
    async fn select_instances(
        &mut self,
        zone: &ZoneId,
        filter: &InstanceFilter,
    ) -> Result<Vec<Instance>>;

    async fn count_instances(&mut self, zone: &ZoneId, filter: &InstanceFilter) -> Result<u64>;

    /// Distinct non-null site ids of a zone's instances.
    async fn distinct_sites(&mut self, zone: &ZoneId) -> Result<BTreeSet<SiteId>>;

    async fn insert_instance(&mut self, zone: &ZoneId, instance: Instance) -> Result<()>;

    /// Apply `patch` to every instance matching `filter`; returns rows touched.
    async fn update_instances(
        &mut self,
        zone: &ZoneId,
        filter: &InstanceFilter,
        patch: &InstancePatch,
    ) -> Result<u64>;

    /// Records of one site, oldest first.
    async fn select_records(&mut self, zone: &ZoneId, site: &SiteId) -> Result<Vec<UsageRecord>>;

    async fn count_records(&mut self, zone: &ZoneId, site: &SiteId) -> Result<u64>;

    /// Delete the single record with the lowest timestamp; returns rows deleted.
    async fn delete_oldest_record(&mut self, zone: &ZoneId, site: &SiteId) -> Result<u64>;

    async fn insert_record(&mut self, record: UsageRecord) -> Result<()>;

    /// Newest record timestamp across all sites of a zone.
    async fn latest_record(&mut self, zone: &ZoneId) -> Result<Option<NaiveDateTime>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Conjunctive equality filter over instance columns. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub site: Option<SiteId>,
    pub elastic: Option<bool>,
    pub status: Option<InstanceStatus>,
    pub device: Option<DeviceId>,
    pub instance_id: Option<String>,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn site(mut self, site: &SiteId) -> Self {
        self.site = Some(site.clone());
        self
    }

    pub fn elastic(mut self, elastic: bool) -> Self {
        self.elastic = Some(elastic);
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn device(mut self, device: &DeviceId) -> Self {
        self.device = Some(device.clone());
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(site) = &self.site
            && instance.site.as_ref() != Some(site)
        {
            return false;
        }
        if let Some(elastic) = self.elastic
            && instance.is_elastic != elastic
        {
            return false;
        }
        if let Some(status) = self.status
            && instance.status != status
        {
            return false;
        }
        if let Some(device) = &self.device
            && instance.device.as_ref() != Some(device)
        {
            return false;
        }
        if let Some(id) = &self.instance_id
            && &instance.instance_id != id
        {
            return false;
        }
        true
    }
}

/// Column assignments for `update_instances`. `None` leaves a column untouched;
/// `Some(None)` sets a nullable column to NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePatch {
    pub site: Option<Option<SiteId>>,
    pub status: Option<InstanceStatus>,
    pub device: Option<Option<DeviceId>>,
}

impl InstancePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn site(mut self, site: Option<SiteId>) -> Self {
        self.site = Some(site);
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn device(mut self, device: Option<DeviceId>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn apply(&self, instance: &mut Instance) {
        if let Some(site) = &self.site {
            instance.site = site.clone();
        }
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(device) = &self.device {
            instance.device = device.clone();
        }
    }
}
