use super::{LeaseError, Result};
use chrono::{DurationRound, NaiveDateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of usage snapshots kept per (zone, site).
pub const RETENTION_CAP: usize = 180;

/// Rendering used for virtual-clock timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:00";

lazy_static::lazy_static! {
    static ref ZONE_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_]{1,64}$").unwrap();
}

/// Validated zone identifier.
///
/// This is the only value ever spliced into a table name, so the character
/// set is restricted to `[A-Za-z0-9_]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ZoneId(String);

impl ZoneId {
    pub fn parse(raw: &str) -> Result<Self> {
        if ZONE_ID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(LeaseError::InvalidIdentifier(format!(
                "zone id '{}' must match [A-Za-z0-9_]{{1,64}}",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ZoneId {
    type Error = LeaseError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ZoneId> for String {
    fn from(value: ZoneId) -> Self {
        value.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! text_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self> {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(LeaseError::InvalidIdentifier(format!(
                        "{} id must not be empty",
                        $label
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = LeaseError;

            fn try_from(value: String) -> Result<Self> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

text_id!(
    /// Edge location inside a zone.
    SiteId,
    "site"
);
text_id!(
    /// Caller-supplied identity of a leasing device.
    DeviceId,
    "device"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Available,
    Using,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Available => f.write_str("available"),
            InstanceStatus::Using => f.write_str("using"),
        }
    }
}

/// A leasable compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub zone: ZoneId,
    pub site: Option<SiteId>,
    pub server_ip: String,
    pub instance_id: String,
    pub pod_name: String,
    pub port: u16,
    pub is_elastic: bool,
    pub status: InstanceStatus,
    pub device: Option<DeviceId>,
}

impl Instance {
    /// A fresh, unleased non-elastic instance pinned to `site`.
    pub fn pinned(
        zone: ZoneId,
        site: SiteId,
        instance_id: impl Into<String>,
        server_ip: impl Into<String>,
        pod_name: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            zone,
            site: Some(site),
            server_ip: server_ip.into(),
            instance_id: instance_id.into(),
            pod_name: pod_name.into(),
            port,
            is_elastic: false,
            status: InstanceStatus::Available,
            device: None,
        }
    }

    /// A fresh, unleased elastic instance with no site binding.
    pub fn elastic(
        zone: ZoneId,
        instance_id: impl Into<String>,
        server_ip: impl Into<String>,
        pod_name: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            zone,
            site: None,
            server_ip: server_ip.into(),
            instance_id: instance_id.into(),
            pod_name: pod_name.into(),
            port,
            is_elastic: true,
            status: InstanceStatus::Available,
            device: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == InstanceStatus::Available
    }

    /// Check the status/device/site invariants of a row.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(LeaseError::InvalidInstance(
                "instance id must not be empty".to_string(),
            ));
        }
        match (self.status, &self.device) {
            (InstanceStatus::Using, None) => {
                return Err(LeaseError::InvalidInstance(format!(
                    "instance '{}' is using but has no device",
                    self.instance_id
                )));
            }
            (InstanceStatus::Available, Some(device)) => {
                return Err(LeaseError::InvalidInstance(format!(
                    "instance '{}' is available but bound to device '{}'",
                    self.instance_id, device
                )));
            }
            _ => {}
        }
        if !self.is_elastic && self.site.is_none() {
            return Err(LeaseError::InvalidInstance(format!(
                "non-elastic instance '{}' must belong to a site",
                self.instance_id
            )));
        }
        if self.is_elastic && self.status == InstanceStatus::Using && self.site.is_none() {
            return Err(LeaseError::InvalidInstance(format!(
                "leased elastic instance '{}' must be bound to a site",
                self.instance_id
            )));
        }
        if self.is_elastic && self.is_available() && self.site.is_some() {
            return Err(LeaseError::InvalidInstance(format!(
                "available elastic instance '{}' must not be bound to a site",
                self.instance_id
            )));
        }
        Ok(())
    }
}

/// One usage snapshot for a (zone, site).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub zone: ZoneId,
    pub site: SiteId,
    pub timestamp: NaiveDateTime,
    pub instances: u64,
}

/// Current wall-clock time truncated to the minute.
pub fn now_minute() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneId {
        ZoneId::parse("z1").unwrap()
    }

    #[test]
    fn test_zone_id_rejects_injection() {
        assert!(ZoneId::parse("eu_west_1").is_ok());
        assert!(ZoneId::parse("").is_err());
        assert!(ZoneId::parse("z1; DROP TABLE instance_z1").is_err());
        assert!(ZoneId::parse("z-1").is_err());
        assert!(ZoneId::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_zone_id_validates_on_deserialize() {
        let ok: ZoneId = serde_json::from_str("\"z1\"").unwrap();
        assert_eq!(ok.as_str(), "z1");
        assert!(serde_json::from_str::<ZoneId>("\"bad zone\"").is_err());
    }

    #[test]
    fn test_text_ids_are_trimmed() {
        assert_eq!(SiteId::parse("  s1 ").unwrap().as_str(), "s1");
        assert!(DeviceId::parse("   ").is_err());
    }

    #[test]
    fn test_instance_invariants() {
        let site = SiteId::parse("s1").unwrap();
        let pinned = Instance::pinned(zone(), site.clone(), "i1", "10.0.0.1", "pod-1", 8080);
        assert!(pinned.validate().is_ok());

        let mut orphan = pinned.clone();
        orphan.site = None;
        assert!(orphan.validate().is_err());

        let mut using_without_device = pinned.clone();
        using_without_device.status = InstanceStatus::Using;
        assert!(using_without_device.validate().is_err());

        let mut bound_elastic = Instance::elastic(zone(), "i2", "10.0.0.2", "pod-2", 8080);
        assert!(bound_elastic.validate().is_ok());
        bound_elastic.site = Some(site);
        assert!(bound_elastic.validate().is_err());

        bound_elastic.status = InstanceStatus::Using;
        bound_elastic.device = Some(DeviceId::parse("d1").unwrap());
        assert!(bound_elastic.validate().is_ok());
        bound_elastic.site = None;
        assert!(bound_elastic.validate().is_err());
    }

    #[test]
    fn test_timestamp_format_drops_seconds() {
        let ts = NaiveDateTime::parse_from_str("2024-05-01 10:42:37", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-05-01 10:42:00");
        assert_eq!(now_minute().format("%S").to_string(), "00");
    }
}
