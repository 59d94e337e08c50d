use crate::allocation::DEFAULT_ALLOCATION_TIMEOUT;
use crate::scheduler::{DEFAULT_RECORD_CONCURRENCY, SchedulerConfig};
use crate::storage::DurabilityMode;
use anyhow::{Context, Result, anyhow};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub acceleration_ratio: NonZeroU32,
    pub data_dir: Option<PathBuf>,
    pub durability: DurabilityMode,
    pub record_concurrency: usize,
    pub allocation_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| anyhow!("{} must be set", key))
        };

        let namespace = required("NAMESPACE")?;

        let host = lookup("LISTEN_HOST")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let port = required("LISTEN_PORT")?
            .parse::<u16>()
            .context("LISTEN_PORT must be a valid u16")?;

        let acceleration_ratio = required("ACCELERATION_RATIO")?
            .parse::<NonZeroU32>()
            .context("ACCELERATION_RATIO must be a positive, non-zero integer")?;

        let data_dir = lookup("STORE_DATA_DIR")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let durability = match lookup("STORE_DURABILITY") {
            Some(raw) => raw
                .parse::<DurabilityMode>()
                .map_err(|err| anyhow!("STORE_DURABILITY: {}", err))?,
            None => DurabilityMode::default(),
        };

        let record_concurrency = lookup("RECORD_CONCURRENCY")
            .unwrap_or_else(|| DEFAULT_RECORD_CONCURRENCY.to_string())
            .parse::<usize>()
            .context("RECORD_CONCURRENCY must be a valid usize")?;
        if record_concurrency == 0 {
            return Err(anyhow!("RECORD_CONCURRENCY must be at least 1"));
        }

        let allocation_timeout = allocation_timeout(&lookup)?;

        Ok(Self {
            namespace,
            host,
            port,
            acceleration_ratio,
            data_dir,
            durability,
            record_concurrency,
            allocation_timeout,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.acceleration_ratio).with_max_concurrency(self.record_concurrency)
    }
}

/// Claim/release deadline from `ALLOCATION_TIMEOUT_MS`.
///
/// One-shot commands read only this key, so it does not require the rest of
/// the service configuration.
pub fn allocation_timeout<F>(lookup: F) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("ALLOCATION_TIMEOUT_MS").filter(|value| !value.trim().is_empty()) {
        Some(raw) => Ok(Duration::from_millis(
            raw.trim()
                .parse::<u64>()
                .context("ALLOCATION_TIMEOUT_MS must be a valid u64")?,
        )),
        None => Ok(DEFAULT_ALLOCATION_TIMEOUT),
    }
}

pub fn allocation_timeout_from_env() -> Result<Duration> {
    dotenvy::dotenv().ok();
    allocation_timeout(|key| std::env::var(key).ok())
}
