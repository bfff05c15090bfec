//! Configuration system for ozonewatch
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (OZONEWATCH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::coordinator::CoordinatorSettings;
use crate::delivery::DeliveryConfig;
use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OzonewatchConfig {
    /// Ground station settings
    pub coordinator: CoordinatorSection,

    /// Outbound delivery queue settings
    pub delivery: DeliverySection,

    /// Simulated fleet settings
    pub fleet: FleetSection,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Ground station settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// Reserved sender id of the ground station
    pub id: PeerId,

    /// Address the inbound listener binds to
    pub listen_addr: String,

    /// Base URL of peer listeners; a peer is reached at `{peer_base_url}:{peer_base_port + id}`
    pub peer_base_url: String,

    /// Port offset for peer listeners
    pub peer_base_port: u16,

    /// Events older than this many seconds are dropped
    pub freshness_secs: u64,

    /// Readings strictly below this level trigger a course adjustment
    pub critical_ozone_level: f64,

    /// Timeout for one outbound HTTP request in milliseconds
    pub request_timeout_ms: u64,
}

/// Outbound delivery queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    /// FIFO capacity of each ground station to peer queue
    pub coordinator_queue_capacity: usize,

    /// FIFO capacity of each satellite to ground station queue
    pub fleet_queue_capacity: usize,

    /// Backoff step in milliseconds; the n-th retry waits n steps
    pub backoff_unit_ms: u64,

    /// Give up on a message after this many retries (0 = never)
    pub max_retries: u32,
}

/// Simulated fleet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    /// Number of satellites to launch (ids 1..=peer_count)
    pub peer_count: u32,

    /// Ground station URL the satellites report to
    pub coordinator_url: String,

    /// Host the satellite listeners bind to
    pub listen_host: String,

    /// Satellite `id` listens on `base_port + id`
    pub base_port: u16,

    /// Pause between readings in milliseconds
    pub report_interval_ms: u64,

    /// Simulated travel time per kilometre flown, in milliseconds
    pub travel_ms_per_km: f64,

    /// Chance per tick that a satellite is lost
    pub loss_probability: f64,

    /// Delay before a satellite starts reporting, in milliseconds
    pub launch_delay_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// File rotation: hourly, daily or never
    pub rotation: String,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            id: 0,
            listen_addr: "0.0.0.0:8000".to_string(),
            peer_base_url: "http://localhost".to_string(),
            peer_base_port: 9000,
            freshness_secs: 20,
            critical_ozone_level: 0.4,
            request_timeout_ms: 5000,
        }
    }
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            coordinator_queue_capacity: 20,
            fleet_queue_capacity: 5,
            backoff_unit_ms: 1000,
            max_retries: 0, // Retry forever
        }
    }
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            peer_count: 5,
            coordinator_url: "http://localhost:8000".to_string(),
            listen_host: "0.0.0.0".to_string(),
            base_port: 9000,
            report_interval_ms: 1000,
            travel_ms_per_km: 1.0,
            loss_probability: 0.0,
            launch_delay_ms: 1000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            rotation: "daily".to_string(),
            max_files: 5,
            json_format: false,
        }
    }
}

impl OzonewatchConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: e.to_string(),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("ozonewatch.toml"),
            dirs::config_dir()
                .map(|p| p.join("ozonewatch").join("config.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".ozonewatch").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/ozonewatch/config.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Coordinator settings
        override_parsed("OZONEWATCH_COORDINATOR_ID", &mut self.coordinator.id);
        if let Ok(val) = std::env::var("OZONEWATCH_LISTEN_ADDR") {
            self.coordinator.listen_addr = val;
        }
        if let Ok(val) = std::env::var("OZONEWATCH_PEER_BASE_URL") {
            self.coordinator.peer_base_url = val;
        }
        override_parsed("OZONEWATCH_PEER_BASE_PORT", &mut self.coordinator.peer_base_port);
        override_parsed("OZONEWATCH_FRESHNESS_SECS", &mut self.coordinator.freshness_secs);
        override_parsed(
            "OZONEWATCH_CRITICAL_OZONE_LEVEL",
            &mut self.coordinator.critical_ozone_level,
        );
        override_parsed(
            "OZONEWATCH_REQUEST_TIMEOUT_MS",
            &mut self.coordinator.request_timeout_ms,
        );

        // Delivery settings
        override_parsed(
            "OZONEWATCH_QUEUE_CAPACITY",
            &mut self.delivery.coordinator_queue_capacity,
        );
        override_parsed(
            "OZONEWATCH_FLEET_QUEUE_CAPACITY",
            &mut self.delivery.fleet_queue_capacity,
        );
        override_parsed("OZONEWATCH_BACKOFF_UNIT_MS", &mut self.delivery.backoff_unit_ms);
        override_parsed("OZONEWATCH_MAX_RETRIES", &mut self.delivery.max_retries);

        // Fleet settings
        override_parsed("OZONEWATCH_PEER_COUNT", &mut self.fleet.peer_count);
        if let Ok(val) = std::env::var("OZONEWATCH_COORDINATOR_URL") {
            self.fleet.coordinator_url = val;
        }
        if let Ok(val) = std::env::var("OZONEWATCH_LISTEN_HOST") {
            self.fleet.listen_host = val;
        }
        override_parsed("OZONEWATCH_FLEET_BASE_PORT", &mut self.fleet.base_port);
        override_parsed("OZONEWATCH_REPORT_INTERVAL_MS", &mut self.fleet.report_interval_ms);
        override_parsed("OZONEWATCH_LOSS_PROBABILITY", &mut self.fleet.loss_probability);

        // Logging settings
        if let Ok(val) = std::env::var("OZONEWATCH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("OZONEWATCH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("OZONEWATCH_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_http_url("coordinator.peer_base_url", &self.coordinator.peer_base_url)?;
        validate_http_url("fleet.coordinator_url", &self.fleet.coordinator_url)?;

        if self.coordinator.listen_addr.is_empty() {
            return Err(Error::config_field_invalid(
                "coordinator.listen_addr",
                "listen_addr cannot be empty",
            ));
        }

        let level = self.coordinator.critical_ozone_level;
        if !(level > 0.0 && level <= 1.0) {
            return Err(Error::config_field_invalid(
                "coordinator.critical_ozone_level",
                format!("critical_ozone_level must be in (0, 1], got {}", level),
            ));
        }

        if self.coordinator.freshness_secs == 0 {
            return Err(Error::config_field_invalid(
                "coordinator.freshness_secs",
                "freshness_secs must be at least 1",
            ));
        }

        if self.delivery.coordinator_queue_capacity == 0 || self.delivery.fleet_queue_capacity == 0 {
            return Err(Error::config_field_invalid(
                "delivery",
                "queue capacities must be at least 1",
            ));
        }

        if self.delivery.backoff_unit_ms == 0 {
            return Err(Error::config_field_invalid(
                "delivery.backoff_unit_ms",
                "backoff_unit_ms must be at least 1",
            ));
        }

        if self.fleet.peer_count == 0 {
            return Err(Error::config_field_invalid(
                "fleet.peer_count",
                "peer_count must be at least 1",
            ));
        }

        if u32::from(self.fleet.base_port) + self.fleet.peer_count > u32::from(u16::MAX) {
            return Err(Error::config_field_invalid(
                "fleet.base_port",
                "base_port + peer_count exceeds the port range",
            ));
        }

        let loss = self.fleet.loss_probability;
        if !(0.0..=1.0).contains(&loss) {
            return Err(Error::config_field_invalid(
                "fleet.loss_probability",
                format!("loss_probability must be between 0 and 1, got {}", loss),
            ));
        }

        if !(self.fleet.travel_ms_per_km >= 0.0 && self.fleet.travel_ms_per_km.is_finite()) {
            return Err(Error::config_field_invalid(
                "fleet.travel_ms_per_km",
                "travel_ms_per_km must be a non-negative number",
            ));
        }

        let valid_rotations = ["hourly", "daily", "never"];
        if !valid_rotations.contains(&self.logging.rotation.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.rotation",
                format!(
                    "Invalid rotation '{}'. Must be one of: {}",
                    self.logging.rotation,
                    valid_rotations.join(", ")
                ),
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Decision parameters for the ground station
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            coordinator_id: self.coordinator.id,
            freshness: Duration::from_secs(self.coordinator.freshness_secs),
            critical_ozone_level: self.coordinator.critical_ozone_level,
        }
    }

    /// Queue settings for ground station to peer delivery
    pub fn coordinator_delivery(&self) -> DeliveryConfig {
        self.delivery_with_capacity(self.delivery.coordinator_queue_capacity)
    }

    /// Queue settings for satellite to ground station delivery
    pub fn fleet_delivery(&self) -> DeliveryConfig {
        self.delivery_with_capacity(self.delivery.fleet_queue_capacity)
    }

    /// Timeout for one outbound HTTP request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator.request_timeout_ms)
    }

    fn delivery_with_capacity(&self, capacity: usize) -> DeliveryConfig {
        DeliveryConfig {
            capacity,
            backoff_unit: Duration::from_millis(self.delivery.backoff_unit_ms),
            max_retries: self.delivery.max_retries,
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value)
        .map_err(|e| Error::config_field_invalid(field, format!("Invalid URL '{}': {}", value, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::config_field_invalid(
            field,
            format!("URL must start with http:// or https://, got '{}'", value),
        ));
    }

    Ok(())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ozonewatch")
                .join("config.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# ozonewatch configuration

[coordinator]
# Reserved sender id of the ground station
id = 0

# Address the ground station listens on
listen_addr = "0.0.0.0:8000"

# Peers are reached at {peer_base_url}:{peer_base_port + id}
peer_base_url = "http://localhost"
peer_base_port = 9000

# Events older than this many seconds are dropped
freshness_secs = 20

# Readings strictly below this level redirect the nearest other satellite
critical_ozone_level = 0.4

# Timeout for one outbound HTTP request in milliseconds
request_timeout_ms = 5000

[delivery]
# FIFO capacity per destination
coordinator_queue_capacity = 20
fleet_queue_capacity = 5

# The n-th consecutive failure waits n * backoff_unit_ms
backoff_unit_ms = 1000

# Give up on a message after this many retries (0 = retry forever)
max_retries = 0

[fleet]
# Number of satellites to launch (ids 1..=peer_count)
peer_count = 5

# Ground station URL
coordinator_url = "http://localhost:8000"

# Satellite id listens on listen_host:(base_port + id)
listen_host = "0.0.0.0"
base_port = 9000

# Pause between readings in milliseconds
report_interval_ms = 1000

# Simulated travel time per kilometre
travel_ms_per_km = 1.0

# Chance per tick that a satellite is lost (0 disables)
loss_probability = 0.0

# Delay before a satellite starts reporting in milliseconds
launch_delay_ms = 1000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.ozonewatch/logs/ozonewatch.log"

# File rotation: hourly, daily or never
rotation = "daily"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
