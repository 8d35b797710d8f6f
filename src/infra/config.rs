//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing values fall back to the production defaults.

use crate::domain::geo::Geofence;
use crate::domain::types::{AccuracyTier, Coordinate, PermissionStatus};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Whether a user may join without a validated GPS fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Join only with a fix that passed acquisition and geofence checks
    #[default]
    RequireFix,
    /// Offer "join anyway" when acquisition fails for a retryable reason
    AllowWithoutFix,
}

/// Tunables for one acquisition attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub target_accuracy_meters: f64,
    pub acceptable_accuracy_meters: f64,
    pub max_wait: Duration,
    /// UX floor: never finalize before this much time has passed
    pub min_duration: Duration,
    pub sample_interval: Duration,
    pub accuracy_tier: AccuracyTier,
    pub geofence: Option<Geofence>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            target_accuracy_meters: 15.0,
            acceptable_accuracy_meters: 30.0,
            max_wait: Duration::from_millis(30_000),
            min_duration: Duration::ZERO,
            sample_interval: Duration::from_millis(1_000),
            accuracy_tier: AccuracyTier::High,
            geofence: None,
        }
    }
}

/// Session lifecycle tunables
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub club_slug: String,
    /// Periodic position report cadence while in a queue
    pub report_interval: Duration,
    /// How long a reporter tick waits for a single sample
    pub sample_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            club_slug: "berghain".to_string(),
            report_interval: Duration::from_secs(120),
            sample_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bearer token; token storage itself lives outside this crate
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self { base_url: default_base_url(), timeout_ms: default_timeout_ms(), token: None }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClubSection {
    #[serde(default = "default_club_slug")]
    pub slug: String,
}

impl Default for ClubSection {
    fn default() -> Self {
        Self { slug: default_club_slug() }
    }
}

fn default_club_slug() -> String {
    "berghain".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationSection {
    #[serde(default = "default_target_accuracy")]
    pub target_accuracy_m: f64,
    #[serde(default = "default_acceptable_accuracy")]
    pub acceptable_accuracy_m: f64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default)]
    pub min_duration_ms: u64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default)]
    pub accuracy_tier: AccuracyTier,
}

impl Default for LocationSection {
    fn default() -> Self {
        Self {
            target_accuracy_m: default_target_accuracy(),
            acceptable_accuracy_m: default_acceptable_accuracy(),
            max_wait_ms: default_max_wait_ms(),
            min_duration_ms: 0,
            sample_interval_ms: default_sample_interval_ms(),
            accuracy_tier: AccuracyTier::default(),
        }
    }
}

fn default_target_accuracy() -> f64 {
    15.0
}

fn default_acceptable_accuracy() -> f64 {
    30.0
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceSection {
    /// Measure distance to the venue at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reject fixes outside the radius (false = measure only)
    #[serde(default = "default_true")]
    pub enforce: bool,
    #[serde(default = "default_anchor_lat")]
    pub latitude: f64,
    #[serde(default = "default_anchor_lon")]
    pub longitude: f64,
    #[serde(default = "default_max_distance")]
    pub max_distance_m: f64,
}

impl Default for GeofenceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            enforce: true,
            latitude: default_anchor_lat(),
            longitude: default_anchor_lon(),
            max_distance_m: default_max_distance(),
        }
    }
}

fn default_true() -> bool {
    true
}

// Berghain entrance
fn default_anchor_lat() -> f64 {
    52.5108
}

fn default_anchor_lon() -> f64 {
    13.4434
}

fn default_max_distance() -> f64 {
    500.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default = "default_sample_timeout_ms")]
    pub sample_timeout_ms: u64,
    #[serde(default)]
    pub join_policy: JoinPolicy,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
            sample_timeout_ms: default_sample_timeout_ms(),
            join_policy: JoinPolicy::default(),
        }
    }
}

fn default_report_interval_secs() -> u64 {
    120
}

fn default_sample_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

/// One scripted reading for the simulated location provider
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulatedSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    /// Delay from subscription start
    #[serde(default)]
    pub at_ms: u64,
}

/// Location source for hosts without a GPS sensor (CLI, local runs)
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSection {
    #[serde(default = "default_sim_permission")]
    pub permission: PermissionStatus,
    #[serde(default)]
    pub samples: Vec<SimulatedSample>,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self { permission: default_sim_permission(), samples: default_sim_samples() }
    }
}

fn default_sim_permission() -> PermissionStatus {
    PermissionStatus::Granted
}

fn default_sim_samples() -> Vec<SimulatedSample> {
    vec![
        SimulatedSample { latitude: 52.5112, longitude: 13.4441, accuracy_m: 65.0, at_ms: 0 },
        SimulatedSample { latitude: 52.5110, longitude: 13.4438, accuracy_m: 28.0, at_ms: 1_000 },
        SimulatedSample { latitude: 52.5109, longitude: 13.4436, accuracy_m: 9.0, at_ms: 2_000 },
    ]
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub club: ClubSection,
    #[serde(default)]
    pub location: LocationSection,
    #[serde(default)]
    pub geofence: GeofenceSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub simulation: SimulationSection,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    api_base_url: String,
    api_timeout_ms: u64,
    api_token: Option<String>,
    club_slug: String,
    target_accuracy_m: f64,
    acceptable_accuracy_m: f64,
    max_wait_ms: u64,
    min_duration_ms: u64,
    sample_interval_ms: u64,
    accuracy_tier: AccuracyTier,
    geofence_enabled: bool,
    geofence_enforce: bool,
    geofence_anchor: Coordinate,
    geofence_max_distance_m: f64,
    report_interval_secs: u64,
    sample_timeout_ms: u64,
    join_policy: JoinPolicy,
    metrics_interval_secs: u64,
    simulated_permission: PermissionStatus,
    simulated_samples: Vec<SimulatedSample>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let TomlConfig { api, club, location, geofence, session, metrics, simulation } =
            toml_config;
        Self {
            api_base_url: api.base_url.trim_end_matches('/').to_string(),
            api_timeout_ms: api.timeout_ms,
            api_token: api.token.filter(|t| !t.is_empty()),
            club_slug: club.slug,
            target_accuracy_m: location.target_accuracy_m,
            acceptable_accuracy_m: location.acceptable_accuracy_m,
            max_wait_ms: location.max_wait_ms,
            min_duration_ms: location.min_duration_ms,
            sample_interval_ms: location.sample_interval_ms,
            accuracy_tier: location.accuracy_tier,
            geofence_enabled: geofence.enabled,
            geofence_enforce: geofence.enforce,
            geofence_anchor: Coordinate::new(geofence.latitude, geofence.longitude),
            geofence_max_distance_m: geofence.max_distance_m,
            report_interval_secs: session.report_interval_secs,
            sample_timeout_ms: session.sample_timeout_ms,
            join_policy: session.join_policy,
            metrics_interval_secs: metrics.interval_secs,
            simulated_permission: simulation.permission,
            simulated_samples: simulation.samples,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, falling back to defaults when unreadable
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - resolves the path from args/env first
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.target_accuracy_m <= self.acceptable_accuracy_m,
            "location.target_accuracy_m ({}) must not exceed location.acceptable_accuracy_m ({})",
            self.target_accuracy_m,
            self.acceptable_accuracy_m
        );
        anyhow::ensure!(self.max_wait_ms > 0, "location.max_wait_ms must be positive");
        anyhow::ensure!(
            self.report_interval_secs > 0,
            "session.report_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.geofence_max_distance_m > 0.0,
            "geofence.max_distance_m must be positive"
        );
        Ok(())
    }

    /// Acquisition tunables with the configured geofence
    pub fn acquisition(&self) -> AcquisitionConfig {
        let geofence = self.geofence_enabled.then(|| Geofence {
            anchor: self.geofence_anchor,
            max_distance_meters: self.geofence_max_distance_m,
            enforce: self.geofence_enforce,
        });
        AcquisitionConfig {
            target_accuracy_meters: self.target_accuracy_m,
            acceptable_accuracy_meters: self.acceptable_accuracy_m,
            max_wait: Duration::from_millis(self.max_wait_ms),
            min_duration: Duration::from_millis(self.min_duration_ms),
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            accuracy_tier: self.accuracy_tier,
            geofence,
        }
    }

    /// Session tunables
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            club_slug: self.club_slug.clone(),
            report_interval: Duration::from_secs(self.report_interval_secs),
            sample_timeout: Duration::from_millis(self.sample_timeout_ms),
        }
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn api_timeout_ms(&self) -> u64 {
        self.api_timeout_ms
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn club_slug(&self) -> &str {
        &self.club_slug
    }

    pub fn geofence_enabled(&self) -> bool {
        self.geofence_enabled
    }

    pub fn join_policy(&self) -> JoinPolicy {
        self.join_policy
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn simulated_permission(&self) -> PermissionStatus {
        self.simulated_permission
    }

    pub fn simulated_samples(&self) -> &[SimulatedSample] {
        &self.simulated_samples
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to override the API base URL
    pub fn with_api_base_url(mut self, url: &str) -> Self {
        self.api_base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_base_url(), "http://localhost:8000");
        assert_eq!(config.api_timeout_ms(), 10_000);
        assert_eq!(config.club_slug(), "berghain");
        assert_eq!(config.join_policy(), JoinPolicy::RequireFix);
        assert!(config.api_token().is_none());

        let acq = config.acquisition();
        assert_eq!(acq.target_accuracy_meters, 15.0);
        assert_eq!(acq.acceptable_accuracy_meters, 30.0);
        assert_eq!(acq.max_wait, Duration::from_secs(30));
        assert_eq!(acq.min_duration, Duration::ZERO);
        let fence = acq.geofence.unwrap();
        assert_eq!(fence.max_distance_meters, 500.0);
        assert!(fence.enforce);

        let session = config.session();
        assert_eq!(session.report_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_geofence_disabled() {
        let toml_config: TomlConfig = toml::from_str("[geofence]\nenabled = false\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert!(config.acquisition().geofence.is_none());
        assert!(!config.geofence_enabled());
    }

    #[test]
    fn test_validate_rejects_inverted_accuracy() {
        let toml_config: TomlConfig =
            toml::from_str("[location]\ntarget_accuracy_m = 50.0\nacceptable_accuracy_m = 30.0\n")
                .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = Config::default().with_api_base_url("https://api.example.com/");
        assert_eq!(config.api_base_url(), "https://api.example.com");
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["queue-client".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "queue-client".to_string(),
            "--config".to_string(),
            "config/prod.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/prod.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["queue-client".to_string(), "--config=config/staging.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/staging.toml");
    }

    #[test]
    fn test_default_simulation_converges() {
        let config = Config::default();
        assert_eq!(config.simulated_permission(), PermissionStatus::Granted);
        let best = config
            .simulated_samples()
            .iter()
            .map(|s| s.accuracy_m)
            .fold(f64::INFINITY, f64::min);
        assert!(best <= config.acquisition().target_accuracy_meters);
    }
}
