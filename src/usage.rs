//! Per-site usage history with bounded retention.

use crate::core::{
    InstanceStatus, RETENTION_CAP, Result, SiteId, UsageRecord, ZoneId, format_timestamp,
};
use crate::storage::{InstanceFilter, Store};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// What `append_record` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    /// A new record was written; `evicted` is true when the oldest one was
    /// dropped to make room.
    Appended { evicted: bool },
    /// A record for this (zone, site, timestamp) already existed.
    AlreadyRecorded,
}

#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn Store>,
    cap: usize,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_cap(store, RETENTION_CAP)
    }

    pub fn with_cap(store: Arc<dyn Store>, cap: usize) -> Self {
        Self {
            store,
            cap: cap.max(1),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Instances at `site` currently leased.
    pub async fn count_using(&self, zone: &ZoneId, site: &SiteId) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        let count = tx
            .count_instances(
                zone,
                &InstanceFilter::new()
                    .site(site)
                    .status(InstanceStatus::Using),
            )
            .await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Append one snapshot, evicting the oldest when the site is at capacity.
    ///
    /// Existence check, eviction and insert share one transaction. Any error
    /// drops the transaction and leaves the history as it was.
    pub async fn append_record(
        &self,
        zone: &ZoneId,
        site: &SiteId,
        timestamp: NaiveDateTime,
        instances: u64,
    ) -> Result<AppendOutcome> {
        let mut tx = self.store.begin().await?;

        let existing = tx.select_records(zone, site).await?;
        if existing.iter().any(|record| record.timestamp == timestamp) {
            tx.rollback().await?;
            debug!(
                zone = %zone,
                site = %site,
                timestamp = %format_timestamp(&timestamp),
                "Usage already recorded"
            );
            return Ok(AppendOutcome::AlreadyRecorded);
        }

        let count = tx.count_records(zone, site).await?;
        let evicted = count >= self.cap as u64 && tx.delete_oldest_record(zone, site).await? > 0;

        tx.insert_record(UsageRecord {
            zone: zone.clone(),
            site: site.clone(),
            timestamp,
            instances,
        })
        .await?;
        tx.commit().await?;

        Ok(AppendOutcome::Appended { evicted })
    }

    /// Count current usage at `site` and store it under `timestamp`.
    pub async fn record_site(
        &self,
        zone: &ZoneId,
        site: &SiteId,
        timestamp: NaiveDateTime,
    ) -> Result<AppendOutcome> {
        let using = self.count_using(zone, site).await?;
        let outcome = self.append_record(zone, site, timestamp, using).await?;
        debug!(
            zone = %zone,
            site = %site,
            timestamp = %format_timestamp(&timestamp),
            instances = using,
            outcome = ?outcome,
            "Usage recorded"
        );
        Ok(outcome)
    }

    /// Records of one site, oldest first.
    pub async fn history(&self, zone: &ZoneId, site: &SiteId) -> Result<Vec<UsageRecord>> {
        let mut tx = self.store.begin().await?;
        let records = tx.select_records(zone, site).await?;
        tx.commit().await?;
        Ok(records)
    }

    /// Newest timestamp recorded in any of `zones`.
    pub async fn latest_timestamp<'a, I>(&self, zones: I) -> Result<Option<NaiveDateTime>>
    where
        I: IntoIterator<Item = &'a ZoneId>,
    {
        let mut latest = None;
        for zone in zones {
            let mut tx = self.store.begin().await?;
            let newest = tx.latest_record(zone).await?;
            tx.commit().await?;
            latest = latest.max(newest);
        }
        Ok(latest)
    }
}
