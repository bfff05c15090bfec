//! Simulated satellite fleet
//!
//! Launches `peer_count` satellites that report to the ground station and
//! accept course adjustments on their own listeners.

mod satellite;

pub use satellite::*;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::OzonewatchConfig;
use crate::error::Error;
use crate::protocol::PeerId;
use crate::transport::Transport;

/// How the fleet ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    /// Satellites that stopped on shutdown
    pub stopped: Vec<PeerId>,

    /// Satellites that lost contact with the ground station
    pub lost: Vec<PeerId>,

    /// Satellites that could not launch (e.g. their port was taken)
    pub failed: Vec<PeerId>,
}

/// Settings for satellite `id` derived from the configuration
pub fn satellite_settings(config: &OzonewatchConfig, id: PeerId) -> SatelliteSettings {
    let fleet = &config.fleet;
    SatelliteSettings {
        id,
        coordinator_url: fleet.coordinator_url.clone(),
        listen_addr: format!("{}:{}", fleet.listen_host, u32::from(fleet.base_port) + id),
        report_interval: Duration::from_millis(fleet.report_interval_ms),
        travel_per_km: Duration::from_secs_f64(fleet.travel_ms_per_km / 1000.0),
        loss_probability: fleet.loss_probability,
        launch_delay: Duration::from_millis(fleet.launch_delay_ms),
        delivery: config.fleet_delivery(),
    }
}

/// Run satellites `1..=count` until all have stopped or been lost
pub async fn run_fleet(
    config: &OzonewatchConfig,
    count: u32,
    transport: Arc<dyn Transport>,
    shutdown: watch::Receiver<bool>,
) -> FleetReport {
    let mut tasks = JoinSet::new();
    for id in 1..=count {
        let satellite = Satellite::new(satellite_settings(config, id));
        let transport = transport.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { (id, satellite.orbit(transport, shutdown).await) });
    }

    info!(count, coordinator = %config.fleet.coordinator_url, "Fleet launched");

    let mut report = FleetReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(()))) => report.stopped.push(id),
            Ok((id, Err(e))) => {
                let fatal = e.downcast_ref::<Error>().is_some_and(Error::is_fatal);
                error!(satellite = id, fatal, error = %format!("{:#}", e), "Satellite ended");
                if fatal {
                    report.failed.push(id);
                } else {
                    report.lost.push(id);
                }
            }
            Err(e) => error!(error = %e, "Satellite task panicked"),
        }
    }

    report.stopped.sort_unstable();
    report.lost.sort_unstable();
    report.failed.sort_unstable();
    info!(
        stopped = report.stopped.len(),
        lost = report.lost.len(),
        failed = report.failed.len(),
        "Fleet finished"
    );
    report
}
