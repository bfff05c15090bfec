//! ozonewatch binary
//!
//! `ozonewatch coordinator` runs the ground station; `ozonewatch fleet`
//! launches simulated satellites that report to it.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use ozonewatch::cli::{Cli, Commands, ConfigSubcommand};
use ozonewatch::config::{self, LoggingSettings, OzonewatchConfig};
use ozonewatch::coordinator::Coordinator;
use ozonewatch::error::{Error, Result};
use ozonewatch::fleet;
use ozonewatch::logging;
use ozonewatch::peer::{PeerRegistry, QueueFactory};
use ozonewatch::transport::{HttpTransport, Listener, Transport};
use ozonewatch::version;

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    // Commands that don't need the runtime or full logging
    match cli.command {
        Commands::Version { short } => {
            let info = version::build_info();
            if short {
                println!("{}", info.short_version());
            } else {
                print!("{}", info);
            }
            return Ok(());
        }
        Commands::Config { ref subcommand } => {
            let settings = LoggingSettings {
                level: "warn".to_string(),
                ..Default::default()
            };
            let _guards = logging::init_logging(&settings, cli.verbose, cli.quiet)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    let config_path = match &cli.command {
        Commands::Coordinator { config, .. } | Commands::Fleet { config, .. } => config.clone(),
        _ => None,
    };
    let mut config = OzonewatchConfig::load(config_path.as_deref())?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting ozonewatch"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("ozonewatch")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    match cli.command {
        Commands::Coordinator { listen, .. } => {
            if let Some(listen) = listen {
                config.coordinator.listen_addr = listen;
            }
            runtime.block_on(run_coordinator(config))
        }
        Commands::Fleet { count, .. } => {
            let count = count.unwrap_or(config.fleet.peer_count);
            runtime.block_on(run_fleet(config, count))
        }
        Commands::Version { .. } | Commands::Config { .. } => Ok(()),
    }
}

/// Run the ground station until Ctrl-C
async fn run_coordinator(config: OzonewatchConfig) -> Result<()> {
    let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
    let factory = QueueFactory::new(
        transport,
        config.coordinator_delivery(),
        config.coordinator.peer_base_url.clone(),
        config.coordinator.peer_base_port,
    );
    let registry = Arc::new(PeerRegistry::new(factory));
    let coordinator = Arc::new(Coordinator::new(config.coordinator_settings(), registry.clone()));

    let listener = Listener::bind(&config.coordinator.listen_addr).await?;
    info!(
        addr = %listener.local_addr(),
        coordinator_id = config.coordinator.id,
        freshness_secs = config.coordinator.freshness_secs,
        critical_ozone_level = config.coordinator.critical_ozone_level,
        "Ground station ready"
    );
    let listener = listener.spawn(coordinator.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    listener.stop().await;
    let undelivered = registry.shutdown_all().await;
    if undelivered > 0 {
        warn!(undelivered, "Messages left undelivered at shutdown");
    }

    let stats = coordinator.stats();
    info!(
        peers = registry.len(),
        received = stats.received,
        dropped = stats.dropped,
        dispatched = stats.dispatched,
        "Ground station stopped"
    );
    Ok(())
}

/// Run `count` satellites until Ctrl-C or until all are lost
async fn run_fleet(config: OzonewatchConfig, count: u32) -> Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.request_timeout())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = fleet::run_fleet(&config, count, transport, shutdown_rx).await;
    signal.abort();

    if !report.lost.is_empty() {
        warn!(lost = ?report.lost, "Some satellites were lost");
    }
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "Some satellites could not launch");
    }
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = OzonewatchConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            OzonewatchConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
