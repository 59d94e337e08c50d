use anyhow::{Context, Result, anyhow};
use edgelease::config::allocation_timeout_from_env;
use edgelease::core::format_timestamp;
use edgelease::{
    AllocationEngine, AppConfig, DeviceId, DurabilityMode, Instance, LeaseError, LocalLeaderGate,
    MemoryStore, PeriodicScheduler, SiteId, Store, UsageRecorder, ZoneDirectory, ZoneId,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Provision {
    pub zone: String,
    pub site: Option<String>,
    pub instance_id: String,
    pub server_ip: String,
    pub pod_name: String,
    pub port: u16,
    pub elastic: bool,
}

fn open_store(data_dir: Option<&Path>, durability: DurabilityMode) -> Result<MemoryStore> {
    match data_dir {
        Some(dir) => MemoryStore::open(dir, durability)
            .with_context(|| format!("failed to open store in '{}'", dir.display())),
        None => {
            warn!("No data directory configured, usage history will not survive a restart");
            Ok(MemoryStore::new())
        }
    }
}

/// One-shot commands are pointless against a store that vanishes on exit.
pub fn open_durable(data_dir: Option<PathBuf>, durability: DurabilityMode) -> Result<MemoryStore> {
    let dir = data_dir.ok_or_else(|| anyhow!("--data-dir (or STORE_DATA_DIR) is required"))?;
    if durability == DurabilityMode::None {
        return Err(anyhow!("durability 'none' keeps nothing on disk; use sync or async"));
    }
    open_store(Some(&dir), durability)
}

fn shared(store: &MemoryStore) -> Arc<dyn Store> {
    Arc::new(store.clone())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON")?;
    println!("{}", rendered);
    Ok(())
}

fn allocation_engine(store: &MemoryStore) -> Result<AllocationEngine> {
    let timeout = allocation_timeout_from_env()?;
    Ok(AllocationEngine::new(shared(store)).with_timeout(timeout))
}

async fn resolve_zone(store: &MemoryStore, name: &str) -> Result<ZoneId> {
    ZoneDirectory::new(shared(store))
        .resolve(name)
        .await
        .with_context(|| format!("unknown zone '{}'", name.trim()))
}

pub async fn serve(data_dir: Option<PathBuf>, durability: DurabilityMode) -> Result<()> {
    let mut config = AppConfig::from_env().context("failed to load application configuration")?;
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    config.durability = durability;

    let store = open_store(config.data_dir.as_deref(), config.durability)?;
    let scheduler = Arc::new(PeriodicScheduler::new(
        ZoneDirectory::new(shared(&store)),
        UsageRecorder::new(shared(&store)),
        config.scheduler(),
    ));
    let gate = Arc::new(LocalLeaderGate::new());

    info!(
        namespace = %config.namespace,
        address = %config.address(),
        acceleration_ratio = config.acceleration_ratio.get(),
        durable = store.is_durable(),
        "edgelease starting"
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let scheduler = scheduler.clone();
        let gate = gate.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(gate.as_ref(), shutdown).await }
    });
    gate.acquire();

    shutdown_signal().await;
    info!("Shutdown signal received");
    gate.relinquish();
    shutdown.cancel();

    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Scheduler exited with an error"),
        Err(err) => error!(error = %err, "Scheduler task panicked"),
    }

    store.checkpoint().await.context("final checkpoint failed")?;
    info!("edgelease stopped");
    Ok(())
}

pub async fn provision(store: &MemoryStore, request: Provision) -> Result<()> {
    let zone = ZoneId::parse(request.zone.trim())?;
    let instance = match (request.elastic, request.site) {
        (true, _) => Instance::elastic(
            zone.clone(),
            request.instance_id,
            request.server_ip,
            request.pod_name,
            request.port,
        ),
        (false, Some(site)) => Instance::pinned(
            zone.clone(),
            SiteId::parse(&site)?,
            request.instance_id,
            request.server_ip,
            request.pod_name,
            request.port,
        ),
        (false, None) => return Err(anyhow!("a non-elastic instance needs --site")),
    };

    match store.create_zone(&zone).await {
        Ok(()) => info!(zone = %zone, "Zone created"),
        Err(LeaseError::TableExists(_)) => {}
        Err(err) => return Err(err).context("failed to create zone"),
    }

    let mut tx = store.begin().await?;
    tx.insert_instance(&zone, instance.clone()).await?;
    tx.commit().await?;

    print_json(&instance)
}

pub async fn claim(store: &MemoryStore, zone: &str, site: &str, device: &str) -> Result<()> {
    let zone = resolve_zone(store, zone).await?;
    let site = SiteId::parse(site)?;
    let device = DeviceId::parse(device)?;
    let instance = allocation_engine(store)?
        .claim(&zone, &site, &device)
        .await?;
    print_json(&instance)
}

pub async fn release(store: &MemoryStore, zone: &str, device: &str) -> Result<()> {
    let zone = resolve_zone(store, zone).await?;
    let device = DeviceId::parse(device)?;
    let instance = allocation_engine(store)?
        .release(&zone, &device)
        .await?;
    print_json(&instance)
}

pub async fn zones(store: &MemoryStore) -> Result<()> {
    let zones = ZoneDirectory::new(shared(store)).list_zones().await?;
    print_json(&zones)
}

pub async fn usage(store: &MemoryStore, zone: &str, site: &str) -> Result<()> {
    let zone = resolve_zone(store, zone).await?;
    let site = SiteId::parse(site)?;
    let using = UsageRecorder::new(shared(store))
        .count_using(&zone, &site)
        .await?;
    print_json(&serde_json::json!({
        "zone": zone,
        "site": site,
        "using": using,
    }))
}

pub async fn history(store: &MemoryStore, zone: &str, site: &str) -> Result<()> {
    let zone = resolve_zone(store, zone).await?;
    let site = SiteId::parse(site)?;
    let records = UsageRecorder::new(shared(store)).history(&zone, &site).await?;
    let rows: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            serde_json::json!({
                "timestamp": format_timestamp(&record.timestamp),
                "instances": record.instances,
            })
        })
        .collect();
    print_json(&rows)
}

pub async fn checkpoint(store: &MemoryStore) -> Result<()> {
    store.checkpoint().await.context("checkpoint failed")?;
    println!("Checkpoint written");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
