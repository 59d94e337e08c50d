use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("No available instance in zone '{zone}' for site '{site}'")]
    NoAvailableInstance { zone: String, site: String },

    #[error("Device '{device}' already holds instance '{instance_id}' in zone '{zone}'")]
    DeviceAlreadyLeased {
        zone: String,
        device: String,
        instance_id: String,
    },

    #[error("Device '{device}' holds no instance in zone '{zone}'")]
    NotFound { zone: String, device: String },

    #[error("Zone '{0}' not found")]
    ZoneNotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    #[error("Instance '{instance_id}' already exists in zone '{zone}'")]
    DuplicateInstance { zone: String, instance_id: String },

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Failed to scan sites of zone '{zone}': {reason}")]
    ZoneScan { zone: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Scheduler run loop is already active")]
    AlreadyRunning,

    #[error("Leader gate closed")]
    LeadershipClosed,
}

pub type Result<T> = std::result::Result<T, LeaseError>;

/// Caller-facing grouping of failures.
///
/// Capacity exhaustion and transient store trouble are both worth retrying;
/// everything else needs a different request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    CapacityExhausted,
    NotFound,
    Conflict,
    Invalid,
    Transient,
}

impl LeaseError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoAvailableInstance { .. } => ErrorClass::CapacityExhausted,
            Self::NotFound { .. } | Self::ZoneNotFound(_) => ErrorClass::NotFound,
            Self::DeviceAlreadyLeased { .. }
            | Self::DuplicateInstance { .. }
            | Self::TableExists(_)
            | Self::AlreadyRunning => ErrorClass::Conflict,
            Self::InvalidIdentifier(_) | Self::InvalidInstance(_) => ErrorClass::Invalid,
            Self::TableNotFound(_)
            | Self::ZoneScan { .. }
            | Self::Store(_)
            | Self::Persistence(_)
            | Self::Timeout(_)
            | Self::LeadershipClosed => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::CapacityExhausted
        )
    }
}

impl From<std::io::Error> for LeaseError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
