//! Simulated satellite
//!
//! A satellite reports an ozone reading from its current position on every
//! tick, then flies to its next position. Unless the ground station has
//! steered it, the next position is a small random step away. An
//! `adjust-course` command replaces the target for the next flight only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryConfig, DeliveryQueue};
use crate::protocol::{FleetMessage, Kind, Location, PeerId};
use crate::transport::{Listener, MessageHandler, Transport};

/// Largest increase of each coordinate per random step
const MAX_STEP: f64 = 0.1;

// ─────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────

/// Per-satellite runtime settings
#[derive(Debug, Clone)]
pub struct SatelliteSettings {
    /// Satellite id, also its port offset
    pub id: PeerId,

    /// Ground station endpoint readings are sent to
    pub coordinator_url: String,

    /// Address of the satellite's own listener
    pub listen_addr: String,

    /// Pause between readings
    pub report_interval: Duration,

    /// Travel time per kilometre flown
    pub travel_per_km: Duration,

    /// Chance per tick of losing the satellite
    pub loss_probability: f64,

    /// Delay before the first reading
    pub launch_delay: Duration,

    /// Queue settings towards the ground station
    pub delivery: DeliveryConfig,
}

// ─────────────────────────────────────────────────────────────────
// Navigation
// ─────────────────────────────────────────────────────────────────

/// Where a satellite is and where it is heading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Navigation {
    pub location: Location,
    pub target: Location,
    pub steered: bool,
}

impl Navigation {
    /// Start at `location` with no course set
    pub fn at(location: Location) -> Self {
        Self {
            location,
            target: location,
            steered: false,
        }
    }

    /// Choose the next target unless the ground station already set one
    pub fn plan<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if !self.steered {
            self.target = random_step(&self.location, rng);
        }
    }

    /// Accept a target from the ground station
    pub fn steer(&mut self, target: Location) {
        self.target = target;
        self.steered = true;
    }

    /// Arrive at the target and resume free flight
    pub fn arrive(&mut self) {
        self.location = self.target;
        self.steered = false;
    }

    /// Distance to the current target in km
    pub fn remaining_km(&self) -> f64 {
        self.location.distance(&self.target)
    }
}

/// Uniformly random launch position
pub fn random_location<R: Rng + ?Sized>(rng: &mut R) -> Location {
    Location::new(
        rng.gen_range(-90.0..90.0),
        rng.gen_range(-180.0..180.0),
        rng.gen_range(160.0..1960.0),
    )
}

/// Move each coordinate forward by up to [`MAX_STEP`]
pub fn random_step<R: Rng + ?Sized>(from: &Location, rng: &mut R) -> Location {
    let lat = (from.lat + rng.gen_range(0.0..MAX_STEP)).min(90.0);
    let mut lng = from.lng + rng.gen_range(0.0..MAX_STEP);
    if lng >= 180.0 {
        lng -= 360.0;
    }
    let alt = from.alt + rng.gen_range(0.0..MAX_STEP);

    Location::new(lat, lng, alt)
}

/// Simulated sensor: mean of two uniform draws, clustered around 0.5
pub fn read_ozone_level<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen::<f64>() / 2.0 + rng.gen::<f64>() / 2.0
}

// ─────────────────────────────────────────────────────────────────
// Inbound commands
// ─────────────────────────────────────────────────────────────────

struct Steering {
    id: PeerId,
    navigation: Arc<Mutex<Navigation>>,
}

#[async_trait]
impl MessageHandler for Steering {
    async fn handle(&self, message: FleetMessage) {
        match message.kind {
            Kind::AdjustCourse => {
                let mut nav = self.navigation.lock();
                nav.steer(message.location);
                info!(
                    satellite = self.id,
                    distance_km = %format!("{:.2}", nav.remaining_km()),
                    lat = message.location.lat,
                    lng = message.location.lng,
                    "Ground station adjusted our course"
                );
            }
            kind => {
                debug!(satellite = self.id, kind = %kind, "Ignoring message");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Satellite
// ─────────────────────────────────────────────────────────────────

/// One simulated fleet member
pub struct Satellite {
    settings: SatelliteSettings,
    navigation: Arc<Mutex<Navigation>>,
    rng: StdRng,
}

impl Satellite {
    /// Create a satellite at a random launch position
    pub fn new(settings: SatelliteSettings) -> Self {
        let mut rng = StdRng::from_entropy();
        let navigation = Navigation::at(random_location(&mut rng));
        Self::with_rng(settings, navigation, rng)
    }

    /// Create a satellite with a fixed start and random source
    pub fn with_rng(settings: SatelliteSettings, navigation: Navigation, rng: StdRng) -> Self {
        Self {
            settings,
            navigation: Arc::new(Mutex::new(navigation)),
            rng,
        }
    }

    pub fn id(&self) -> PeerId {
        self.settings.id
    }

    /// Current navigation state
    pub fn navigation(&self) -> Navigation {
        *self.navigation.lock()
    }

    /// Run until `shutdown` fires or the satellite is lost.
    ///
    /// A lost satellite stops its listener and queue and returns an error.
    pub async fn orbit(
        mut self,
        transport: Arc<dyn Transport>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let id = self.settings.id;

        let listener = Listener::bind(&self.settings.listen_addr)
            .await
            .with_context(|| format!("satellite {} could not open its listener", id))?;
        let listener = listener.spawn(Arc::new(Steering {
            id,
            navigation: self.navigation.clone(),
        }));

        let queue = DeliveryQueue::spawn(
            self.settings.coordinator_url.clone(),
            transport,
            self.settings.delivery.clone(),
        );

        info!(
            satellite = id,
            listen = %listener.local_addr(),
            location = ?self.navigation().location,
            "Satellite launched"
        );

        let mut lost = false;
        if wait_or_shutdown(self.settings.launch_delay, &mut shutdown).await {
            loop {
                let (location, distance_km) = {
                    let mut nav = self.navigation.lock();
                    nav.plan(&mut self.rng);
                    (nav.location, nav.remaining_km())
                };

                let p = self.settings.loss_probability;
                if p > 0.0 && self.rng.gen_bool(p) {
                    lost = true;
                    break;
                }

                let reading = FleetMessage::reading(id, location, read_ozone_level(&mut self.rng));
                let level = reading.ozone_level;
                let enqueued = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    result = queue.enqueue(reading) => result,
                };
                match enqueued {
                    Ok(seq) => debug!(satellite = id, seq, ozone_level = level, "Reading queued"),
                    Err(e) => warn!(satellite = id, error = %e, "Could not queue reading"),
                }

                let flight = self.settings.travel_per_km.mul_f64(distance_km.max(0.0));
                debug!(
                    satellite = id,
                    distance_km = %format!("{:.2}", distance_km),
                    "Flying to next location"
                );
                if !wait_or_shutdown(self.settings.report_interval + flight, &mut shutdown).await {
                    break;
                }
                self.navigation.lock().arrive();
            }
        }

        listener.stop().await;
        let undelivered = queue.shutdown().await;
        info!(satellite = id, undelivered = undelivered.len(), "Satellite stopped");

        if lost {
            bail!("satellite {} lost contact with the ground station", id);
        }
        Ok(())
    }
}

/// Sleep for `delay`; `false` if shutdown was requested first
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
