//! Zone and site discovery.
//!
//! Zones are not stored anywhere as rows: a zone exists while its
//! `instance_<zone>` table exists, and a site exists while some instance in
//! that table points at it.

use crate::core::{LeaseError, Result, SiteId, ZoneId};
use crate::storage::Store;
use crate::storage::catalog::{INSTANCE_TABLE_PREFIX, zone_of_instance_table};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub type ZoneMap = BTreeMap<ZoneId, BTreeSet<SiteId>>;

#[derive(Clone)]
pub struct ZoneDirectory {
    store: Arc<dyn Store>,
}

impl ZoneDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Zones whose instance partition exists, in id order.
    pub async fn zones(&self) -> Result<Vec<ZoneId>> {
        let tables = self.store.list_tables(INSTANCE_TABLE_PREFIX).await?;
        let mut zones: Vec<ZoneId> = tables
            .iter()
            .filter_map(|table| {
                let zone = zone_of_instance_table(table);
                if zone.is_none() {
                    debug!(table = %table, "Ignoring table outside the partition pattern");
                }
                zone
            })
            .collect();
        zones.sort();
        zones.dedup();
        Ok(zones)
    }

    /// Distinct sites referenced by a zone's instances.
    pub async fn sites(&self, zone: &ZoneId) -> Result<BTreeSet<SiteId>> {
        let mut tx = self.store.begin().await?;
        let sites = tx.distinct_sites(zone).await?;
        tx.commit().await?;
        Ok(sites)
    }

    /// Every zone with its sites.
    ///
    /// A zone whose site scan fails is logged and left out; only a failure to
    /// enumerate the partitions themselves is returned.
    pub async fn list_zones(&self) -> Result<ZoneMap> {
        let mut zones = ZoneMap::new();
        for zone in self.zones().await? {
            match self.sites(&zone).await {
                Ok(sites) => {
                    zones.insert(zone, sites);
                }
                Err(err) => {
                    let err = LeaseError::ZoneScan {
                        zone: zone.to_string(),
                        reason: err.to_string(),
                    };
                    warn!(zone = %zone, error = %err, "Skipping zone");
                }
            }
        }
        debug!(zones = zones.len(), "Zone directory scanned");
        Ok(zones)
    }

    /// Turn request text into a `ZoneId` the directory has actually seen.
    pub async fn resolve(&self, name: &str) -> Result<ZoneId> {
        let candidate = ZoneId::parse(name.trim())?;
        if self.zones().await?.contains(&candidate) {
            Ok(candidate)
        } else {
            Err(LeaseError::ZoneNotFound(candidate.to_string()))
        }
    }
}
