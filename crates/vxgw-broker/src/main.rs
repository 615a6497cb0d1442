//! VXLAN gateway daemon.
//!
//! Starts one sync broker per configured VTEP and keeps them running until
//! SIGINT. Devices are simulated in memory: each configured VTEP is backed
//! by a `MemoryVtep` and the overlay directory lives in process.

use anyhow::Context;
use clap::Parser;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use vxgw_broker::config::DEFAULT_CONFIG_PATH;
use vxgw_broker::{
    Connector, FloodingProxyFeed, GatewayConfig, GatewayService, MemoryDirectory, VtepConfig,
};
use vxgw_vtep::{MemoryVtep, VtepControlClient};

/// VXLAN gateway daemon
#[derive(Parser, Debug)]
#[command(name = "vxgwd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).json())
            .init();
    } else {
        registry.with(fmt::layer().with_target(true).compact()).init();
    }
}

fn simulated_device(vtep: &VtepConfig) -> MemoryVtep {
    MemoryVtep::new(
        &vtep.name,
        vtep.mgmt_ip,
        vtep.tunnel_ip,
        vtep.ports.iter().cloned(),
    )
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.json);

    info!("vxgwd: Starting VXLAN gateway daemon");
    match run(args).await {
        Ok(()) => {
            info!("vxgwd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "vxgwd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = GatewayConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;
    info!(
        vteps = config.vteps.len(),
        tunnel_zones = config.tunnel_zones.len(),
        "vxgwd: Configuration loaded (simulation mode)"
    );

    let feed = FloodingProxyFeed::new();
    for zone in &config.tunnel_zones {
        if let Some(proxy) = zone.flooding_proxy {
            feed.set_proxy(zone.id, proxy);
        }
    }

    let devices: HashMap<Ipv4Addr, Arc<MemoryVtep>> = config
        .vteps
        .iter()
        .map(|vtep| (vtep.mgmt_ip, Arc::new(simulated_device(vtep))))
        .collect();

    let connector: Connector = Arc::new(move |vtep: &VtepConfig| {
        let device = devices
            .get(&vtep.mgmt_ip)
            .cloned()
            .unwrap_or_else(|| Arc::new(simulated_device(vtep)));
        Arc::new(VtepControlClient::new(device))
    });

    let service = GatewayService::new(Arc::new(MemoryDirectory::new()), feed, connector)
        .with_terminate_timeout(config.terminate_timeout());

    for vtep in &config.vteps {
        if let Err(e) = service.start_vtep(vtep).await {
            warn!(mgmt_ip = %vtep.mgmt_ip, error = %e, "vxgwd: Failed to start VTEP");
        }
    }
    info!(active = service.active_vteps().len(), "vxgwd: Brokers running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    warn!("vxgwd: Received SIGINT, shutting down gracefully...");

    service.shutdown().await;
    Ok(())
}
