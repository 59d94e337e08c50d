mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use edgelease::DurabilityMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "edgelease")]
#[command(about = "Lease edge instances to devices and record per-site usage")]
pub struct Cli {
    /// Directory holding the WAL and snapshot.
    #[arg(long, global = true, env = "STORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// sync, async or none.
    #[arg(long, global = true, env = "STORE_DURABILITY", default_value = "sync")]
    durability: DurabilityMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the leader-gated usage recorder until Ctrl+C / SIGTERM.
    Serve,
    /// Add an instance to a zone, creating the zone's tables on first use.
    Provision {
        #[arg(long)]
        zone: String,
        #[arg(long)]
        instance_id: String,
        #[arg(long)]
        server_ip: String,
        #[arg(long)]
        pod_name: String,
        #[arg(long)]
        port: u16,
        /// Home site; omit together with --elastic for a shared instance.
        #[arg(long, required_unless_present = "elastic")]
        site: Option<String>,
        #[arg(long)]
        elastic: bool,
    },
    Claim {
        #[arg(long)]
        zone: String,
        #[arg(long)]
        site: String,
        #[arg(long)]
        device: String,
    },
    Release {
        #[arg(long)]
        zone: String,
        #[arg(long)]
        device: String,
    },
    /// List zones with their sites.
    Zones,
    /// Instances currently leased at a site.
    Usage {
        #[arg(long)]
        zone: String,
        #[arg(long)]
        site: String,
    },
    /// Recorded usage of a site, oldest first.
    History {
        #[arg(long)]
        zone: String,
        #[arg(long)]
        site: String,
    },
    /// Write a snapshot and truncate the WAL.
    Checkpoint,
}

pub async fn run(cli: Cli) -> Result<()> {
    let Cli {
        data_dir,
        durability,
        command,
    } = cli;

    match command {
        Command::Serve => commands::serve(data_dir, durability).await,
        Command::Provision {
            zone,
            instance_id,
            server_ip,
            pod_name,
            port,
            site,
            elastic,
        } => {
            let store = commands::open_durable(data_dir, durability)?;
            let request = commands::Provision {
                zone,
                site,
                instance_id,
                server_ip,
                pod_name,
                port,
                elastic,
            };
            commands::provision(&store, request).await
        }
        Command::Claim { zone, site, device } => {
            let store = commands::open_durable(data_dir, durability)?;
            commands::claim(&store, &zone, &site, &device).await
        }
        Command::Release { zone, device } => {
            let store = commands::open_durable(data_dir, durability)?;
            commands::release(&store, &zone, &device).await
        }
        Command::Zones => {
            let store = commands::open_durable(data_dir, durability)?;
            commands::zones(&store).await
        }
        Command::Usage { zone, site } => {
            let store = commands::open_durable(data_dir, durability)?;
            commands::usage(&store, &zone, &site).await
        }
        Command::History { zone, site } => {
            let store = commands::open_durable(data_dir, durability)?;
            commands::history(&store, &zone, &site).await
        }
        Command::Checkpoint => {
            let store = commands::open_durable(data_dir, durability)?;
            commands::checkpoint(&store).await
        }
    }
}
