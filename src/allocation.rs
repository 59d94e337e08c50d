//! Instance claim and release.
//!
//! A claim prefers a pinned instance at the requesting site and falls back to
//! the zone's elastic pool, binding the elastic instance to that site for the
//! duration of the lease.

use crate::core::{DeviceId, Instance, InstanceStatus, LeaseError, Result, SiteId, ZoneId};
use crate::storage::{InstanceFilter, InstancePatch, Store, Transaction};
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Which pool a claim was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Site,
    Elastic,
}

pub struct AllocationEngine {
    store: Arc<dyn Store>,
    // Serializes select-then-update for every zone and site.
    claim_lock: Mutex<()>,
    timeout: Duration,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            claim_lock: Mutex::new(()),
            timeout: DEFAULT_ALLOCATION_TIMEOUT,
        }
    }

    /// Bound every claim/release, lock wait included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lease an instance in `zone` to `device` on behalf of `site`.
    pub async fn claim(&self, zone: &ZoneId, site: &SiteId, device: &DeviceId) -> Result<Instance> {
        let (instance, tier) = self
            .bounded(async {
                let _guard = self.claim_lock.lock().await;
                let mut tx = self.store.begin().await?;
                let claimed = claim_in(tx.as_mut(), zone, site, device).await?;
                tx.commit().await?;
                Ok(claimed)
            })
            .await?;

        info!(
            zone = %zone,
            site = %site,
            device = %device,
            instance = %instance.instance_id,
            tier = ?tier,
            "Instance claimed"
        );
        Ok(instance)
    }

    /// End the lease held by `device` in `zone`.
    ///
    /// Elastic instances go back to the shared pool with their site cleared;
    /// pinned instances keep their site.
    pub async fn release(&self, zone: &ZoneId, device: &DeviceId) -> Result<Instance> {
        let released = self
            .bounded(async {
                let _guard = self.claim_lock.lock().await;
                let mut tx = self.store.begin().await?;
                let released = release_in(tx.as_mut(), zone, device).await?;
                tx.commit().await?;
                Ok(released)
            })
            .await?;

        info!(
            zone = %zone,
            device = %device,
            instance = %released.instance_id,
            elastic = released.is_elastic,
            "Instance released"
        );
        Ok(released)
    }

    /// The instance `device` currently holds in `zone`, if any.
    pub async fn lease_of(&self, zone: &ZoneId, device: &DeviceId) -> Result<Option<Instance>> {
        self.bounded(async {
            let mut tx = self.store.begin().await?;
            let mut held = tx
                .select_instances(zone, &InstanceFilter::new().device(device))
                .await?;
            tx.commit().await?;
            Ok(held.pop())
        })
        .await
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Allocation operation timed out");
                Err(LeaseError::Timeout(self.timeout))
            }
        }
    }
}

async fn claim_in(
    tx: &mut dyn Transaction,
    zone: &ZoneId,
    site: &SiteId,
    device: &DeviceId,
) -> Result<(Instance, Tier)> {
    let held = tx
        .select_instances(zone, &InstanceFilter::new().device(device))
        .await?;
    if let Some(existing) = held.into_iter().next() {
        return Err(LeaseError::DeviceAlreadyLeased {
            zone: zone.to_string(),
            device: device.to_string(),
            instance_id: existing.instance_id,
        });
    }

    let pinned = tx
        .select_instances(
            zone,
            &InstanceFilter::new()
                .site(site)
                .elastic(false)
                .status(InstanceStatus::Available),
        )
        .await?;
    if let Some(instance) = pick_random(pinned) {
        let patch = InstancePatch::new()
            .status(InstanceStatus::Using)
            .device(Some(device.clone()));
        let leased = lease(tx, zone, instance, patch).await?;
        return Ok((leased, Tier::Site));
    }

    debug!(zone = %zone, site = %site, "No pinned instance free, trying elastic pool");
    let elastic = tx
        .select_instances(
            zone,
            &InstanceFilter::new()
                .elastic(true)
                .status(InstanceStatus::Available),
        )
        .await?;
    if let Some(instance) = pick_random(elastic) {
        let patch = InstancePatch::new()
            .site(Some(site.clone()))
            .status(InstanceStatus::Using)
            .device(Some(device.clone()));
        let leased = lease(tx, zone, instance, patch).await?;
        return Ok((leased, Tier::Elastic));
    }

    Err(LeaseError::NoAvailableInstance {
        zone: zone.to_string(),
        site: site.to_string(),
    })
}

async fn lease(
    tx: &mut dyn Transaction,
    zone: &ZoneId,
    mut instance: Instance,
    patch: InstancePatch,
) -> Result<Instance> {
    let touched = tx
        .update_instances(
            zone,
            &InstanceFilter::new()
                .instance_id(instance.instance_id.clone())
                .status(InstanceStatus::Available),
            &patch,
        )
        .await?;
    if touched != 1 {
        return Err(LeaseError::store(format!(
            "expected to lease exactly one row for instance '{}', touched {}",
            instance.instance_id, touched
        )));
    }
    patch.apply(&mut instance);
    Ok(instance)
}

async fn release_in(tx: &mut dyn Transaction, zone: &ZoneId, device: &DeviceId) -> Result<Instance> {
    let held = tx
        .select_instances(zone, &InstanceFilter::new().device(device))
        .await?;
    let Some(mut instance) = held.into_iter().next() else {
        return Err(LeaseError::NotFound {
            zone: zone.to_string(),
            device: device.to_string(),
        });
    };

    let mut patch = InstancePatch::new()
        .status(InstanceStatus::Available)
        .device(None);
    if instance.is_elastic {
        patch = patch.site(None);
    }
    tx.update_instances(zone, &InstanceFilter::new().device(device), &patch)
        .await?;
    patch.apply(&mut instance);
    Ok(instance)
}

fn pick_random(candidates: Vec<Instance>) -> Option<Instance> {
    candidates.choose(&mut rand::thread_rng()).cloned()
}
