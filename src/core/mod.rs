pub mod error;
pub mod types;

pub use error::{ErrorClass, LeaseError, Result};
pub use types::{
    DeviceId, Instance, InstanceStatus, RETENTION_CAP, SiteId, TIMESTAMP_FORMAT, UsageRecord,
    ZoneId, format_timestamp, now_minute,
};
