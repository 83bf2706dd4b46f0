use crate::device::NetworkType;
use crate::filter::{FilterConfig, PriorityHint};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Unknown filter profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration for the tracker service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Filter profile and overrides
    #[serde(default)]
    pub filter: FilterSettings,
    /// Local state store
    #[serde(default)]
    pub store: StoreConfig,
    /// Remote write endpoint
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Sample source
    #[serde(default)]
    pub source: SourceConfig,
    /// Device status served by the static provider
    #[serde(default)]
    pub device: DeviceConfig,
    /// Offline geocoder
    #[serde(default)]
    pub geocoder: GeocoderConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Named filter profile plus optional per-field overrides
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSettings {
    /// Preset name (balanced, precise, test)
    #[serde(default = "default_filter_profile")]
    pub profile: String,
    pub max_accuracy_meters: Option<f32>,
    pub min_displacement_meters: Option<f64>,
    pub update_interval_ms: Option<u64>,
    pub min_sample_interval_ms: Option<u64>,
    pub max_sample_age_ms: Option<i64>,
    pub priority_hint: Option<PriorityHint>,
    pub wait_for_precise_fix: Option<bool>,
}

/// Local state store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding the persisted flags
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Remote write configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Remote function receiving every record
    #[serde(default = "default_function_name")]
    pub function_name: String,
    /// Collection named in the payload
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Journal file written by the local sink
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    /// Overrides the `<manufacturer>-<device>` identifier
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff for transient remote failures
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Replay sample source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Newline-delimited JSON samples
    #[serde(default = "default_replay_path")]
    pub replay_path: PathBuf,
    /// Delay between delivered samples in milliseconds
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
}

/// Device readings reported by the static status provider
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub manufacturer: String,
    pub model: String,
    pub device: String,
    pub os_version: String,
    pub screen_on: bool,
    pub locked: bool,
    pub power_save_mode: bool,
    /// Battery level out of 100; negative when unknown
    pub battery_level: i32,
    pub charging: bool,
    pub network_type: NetworkType,
    pub has_internet: bool,
    pub gps_enabled: bool,
    pub fine_location_granted: bool,
    pub background_location_granted: bool,
}

/// Places known to the offline geocoder
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default)]
    pub places: Vec<PlaceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceConfig {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_place_radius")]
    pub radius_meters: f64,
    pub address_lines: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "location-tracker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_filter_profile() -> String {
    "balanced".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/tracker-state.json")
}

fn default_function_name() -> String {
    crate::pipeline::DEFAULT_FUNCTION_NAME.to_string()
}

fn default_collection() -> String {
    crate::pipeline::DEFAULT_COLLECTION.to_string()
}

fn default_output_path() -> PathBuf {
    PathBuf::from("data/records.jsonl")
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_replay_path() -> PathBuf {
    PathBuf::from("data/samples.jsonl")
}

fn default_pace_ms() -> u64 {
    1000
}

fn default_place_radius() -> f64 {
    1000.0
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_builder(
            config::Config::builder()
                // Add config file if present
                .add_source(config::File::with_name("config/tracker").required(false))
                .add_source(
                    config::File::with_name("/etc/location-tracker/tracker").required(false),
                )
                // Override with environment variables
                // TRACKER__FILTER__PROFILE -> filter.profile
                .add_source(
                    config::Environment::with_prefix("TRACKER")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config: Config = builder
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("filter.profile", default_filter_profile())?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter.resolve()?;

        if self.remote.function_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "remote.function_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.remote.collection.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "remote.collection",
                reason: "must not be empty".to_string(),
            });
        }
        if self.remote.retry.max_backoff_ms < self.remote.retry.initial_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "remote.retry.max_backoff_ms",
                reason: "must not be below initial_backoff_ms".to_string(),
            });
        }
        if !matches!(self.service.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::Invalid {
                field: "service.log_format",
                reason: format!("expected json or pretty, got {}", self.service.log_format),
            });
        }

        Ok(())
    }
}

impl FilterSettings {
    /// Preset named by `profile` with the overrides applied
    pub fn resolve(&self) -> Result<FilterConfig, ConfigError> {
        let mut config = FilterConfig::preset(&self.profile)
            .ok_or_else(|| ConfigError::UnknownProfile(self.profile.clone()))?;

        if let Some(v) = self.max_accuracy_meters {
            config.max_accuracy_meters = v;
        }
        if let Some(v) = self.min_displacement_meters {
            config.min_displacement_meters = v;
        }
        if let Some(v) = self.update_interval_ms {
            config.update_interval_ms = v;
        }
        if let Some(v) = self.min_sample_interval_ms {
            config.min_sample_interval_ms = v;
        }
        if let Some(v) = self.max_sample_age_ms {
            config.max_sample_age_ms = v;
        }
        if let Some(v) = self.priority_hint {
            config.priority_hint = v;
        }
        if let Some(v) = self.wait_for_precise_fix {
            config.wait_for_precise_fix = v;
        }

        if config.max_accuracy_meters.is_nan() || config.max_accuracy_meters < 0.0 {
            return Err(ConfigError::Invalid {
                field: "filter.max_accuracy_meters",
                reason: format!("must be non-negative, got {}", config.max_accuracy_meters),
            });
        }
        if config.min_displacement_meters.is_nan() || config.min_displacement_meters < 0.0 {
            return Err(ConfigError::Invalid {
                field: "filter.min_displacement_meters",
                reason: format!("must be non-negative, got {}", config.min_displacement_meters),
            });
        }
        if config.max_sample_age_ms < 0 {
            return Err(ConfigError::Invalid {
                field: "filter.max_sample_age_ms",
                reason: format!("must be non-negative, got {}", config.max_sample_age_ms),
            });
        }

        Ok(config)
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl SourceConfig {
    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            profile: default_filter_profile(),
            max_accuracy_meters: None,
            min_displacement_meters: None,
            update_interval_ms: None,
            min_sample_interval_ms: None,
            max_sample_age_ms: None,
            priority_hint: None,
            wait_for_precise_fix: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            function_name: default_function_name(),
            collection: default_collection(),
            output_path: default_output_path(),
            device_id: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            replay_path: default_replay_path(),
            pace_ms: default_pace_ms(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            manufacturer: "Generic".to_string(),
            model: "Tracker".to_string(),
            device: "tracker".to_string(),
            os_version: "14".to_string(),
            screen_on: true,
            locked: false,
            power_save_mode: false,
            battery_level: 100,
            charging: false,
            network_type: NetworkType::Wifi,
            has_internet: true,
            gps_enabled: true,
            fine_location_granted: true,
            background_location_granted: true,
        }
    }
}
