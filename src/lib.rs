// ============================================================================
// edgelease library
// ============================================================================
//
// Leases edge compute instances to devices and keeps a bounded, per-site
// history of how many instances were in use each simulated minute.

pub mod allocation;
pub mod config;
pub mod core;
pub mod directory;
pub mod leader;
pub mod scheduler;
pub mod storage;
pub mod usage;

pub use allocation::{AllocationEngine, Tier};
pub use config::AppConfig;
pub use core::{
    DeviceId, ErrorClass, Instance, InstanceStatus, LeaseError, Result, SiteId, UsageRecord,
    ZoneId,
};
pub use directory::{ZoneDirectory, ZoneMap};
pub use leader::{LeaderGate, LocalLeaderGate};
pub use scheduler::{PeriodicScheduler, SchedulerConfig, SchedulerState, TickReport, VirtualClock};
pub use storage::{DurabilityMode, MemoryStore, Store, Transaction};
pub use usage::{AppendOutcome, UsageRecorder};
