//! Emulator configuration from environment and command line.
//!
//! Environment variables provide defaults, command-line flags override them,
//! and [`Config::validate`] enforces the safety limits before anything
//! touches the network.

use clap::Parser;
use para_sdk::RetryPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Longest run the emulator accepts (24 hours).
pub const MAX_DURATION_MINUTES: u64 = 1440;

const DEFAULT_DOMAIN: &str = "localhost";
const DEFAULT_MQTT_PORT: u16 = 8883;
const DEFAULT_MAX_DEVICES: usize = 500;
const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 5;
const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);
const UNSAFE_UPDATE_INTERVAL_SECS: u64 = 1;
const DEFAULT_API_RATE_LIMIT: u32 = 10;
const DEFAULT_DEDICATED_CONNECTION_THRESHOLD: usize = 50;
const REGISTRATION_WORKERS: usize = 10;
const REGISTRATION_BATCH_SIZE: usize = 20;
const REGISTRATION_BATCH_DELAY_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("number of devices must be at least 1")]
    NoDevices,
    #[error("{requested} devices exceeds the per-instance limit of {limit} (use --force to override)")]
    TooManyDevices { requested: usize, limit: usize },
    #[error("duration must be between 1 and {max} minutes, got {0}", max = MAX_DURATION_MINUTES)]
    InvalidDuration(u64),
    #[error("update interval must be at least {min:?}, got {0:?}", min = MIN_UPDATE_INTERVAL)]
    InvalidUpdateInterval(Duration),
    #[error("no secret for manufacturer {manufacturer}: set MANUFACTURER_SECRET_{manufacturer} or save it in {}", .secrets_file.display())]
    MissingSecret {
        manufacturer: String,
        secrets_file: PathBuf,
    },
    #[error("TLS certificates not found: {} (pass --insecure-tls to connect without verification)", .0.join(", "))]
    MissingCertificates(Vec<String>),
    #[error("failed to read secrets file {}: {source}", .path.display())]
    SecretsFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed secrets file {}: {source}", .path.display())]
    SecretsFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Command-line flags.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "para-emulator",
    version,
    about = "Simulate GPS tracking for a fleet of paraglider devices",
    after_help = "Safety features: single instance lock, rate limiting, device count limits"
)]
pub struct Args {
    /// Number of devices to simulate
    #[arg(long, default_value_t = 10)]
    pub devices: usize,

    /// Simulation duration in minutes
    #[arg(long, default_value_t = 60)]
    pub duration: u64,

    /// Domain/hostname for API and MQTT connections
    #[arg(long)]
    pub domain: Option<String>,

    /// Manufacturer name
    #[arg(short, long)]
    pub manufacturer: Option<String>,

    /// Disable safety features (1-second updates, no rate limiting)
    #[arg(long = "unsafe")]
    pub unsafe_mode: bool,

    /// Start even if the device limit is exceeded
    #[arg(long)]
    pub force: bool,

    /// Connect to the broker and API without verifying certificates
    #[arg(long)]
    pub insecure_tls: bool,

    /// Verify the broker certificate chain but not its host name
    #[arg(long)]
    pub skip_hostname_check: bool,
}

#[derive(Clone)]
pub struct Config {
    pub domain: String,
    /// Explicit API base; derived from the domain when unset
    pub api_base_url: Option<String>,
    /// Explicit broker host; the domain when unset
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,
    pub manufacturer: String,
    pub manufacturer_secret: Option<String>,
    pub secrets_file: PathBuf,
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub max_devices: usize,
    pub devices: usize,
    pub duration_minutes: u64,
    duration_override: Option<Duration>,
    pub safe_mode: bool,
    pub force: bool,
    pub insecure_tls: bool,
    pub skip_hostname_check: bool,
    safe_update_interval: Duration,
    api_rate_limit: u32,
    pub dedicated_connection_threshold: usize,
    pub registration_workers: usize,
    pub registration_batch_size: usize,
    pub registration_batch_delay: Duration,
    pub retry: RetryPolicy,
    pub lock_file: PathBuf,
    pub results_file: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("domain", &self.domain)
            .field("api_base_url", &self.api_base_url())
            .field("mqtt", &format_args!("{}:{}", self.mqtt_host(), self.mqtt_port))
            .field("mqtt_user", &self.mqtt_user)
            .field("manufacturer", &self.manufacturer)
            .field("devices", &self.devices)
            .field("duration_minutes", &self.duration_minutes)
            .field("safe_mode", &self.safe_mode)
            .field("insecure_tls", &self.insecure_tls)
            .field("skip_hostname_check", &self.skip_hostname_check)
            .field("lock_file", &self.lock_file)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let manufacturer = var("MANUFACTURER").unwrap_or_else(|| "DIGIFLY".to_string());
        let manufacturer_secret = var(&secret_var(&manufacturer));

        Self {
            domain: var("EMULATOR_DOMAIN").unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
            api_base_url: var("API_BASE_URL"),
            mqtt_host: var("MQTT_HOST"),
            mqtt_port: var("MQTT_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MQTT_PORT),
            mqtt_user: var("MQTT_USER").unwrap_or_else(|| "mqtt_user".to_string()),
            mqtt_password: var("MQTT_PASSWORD").unwrap_or_else(|| "mqtt_secure_password".to_string()),
            manufacturer,
            manufacturer_secret,
            secrets_file: default_secrets_file(&var),
            ca_cert: var("CA_CERT").unwrap_or_else(|| "./certs/ca.crt".to_string()).into(),
            client_cert: var("CLIENT_CERT")
                .unwrap_or_else(|| "./certs/client.crt".to_string())
                .into(),
            client_key: var("CLIENT_KEY")
                .unwrap_or_else(|| "./certs/client.key".to_string())
                .into(),
            max_devices: var("MAX_DEVICES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_DEVICES),
            devices: 10,
            duration_minutes: 60,
            duration_override: None,
            safe_mode: true,
            force: false,
            insecure_tls: false,
            skip_hostname_check: false,
            safe_update_interval: Duration::from_secs(
                var("UPDATE_INTERVAL")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS),
            ),
            api_rate_limit: var("API_RATE_LIMIT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_API_RATE_LIMIT),
            dedicated_connection_threshold: var("DEDICATED_CONNECTION_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DEDICATED_CONNECTION_THRESHOLD),
            registration_workers: REGISTRATION_WORKERS,
            registration_batch_size: REGISTRATION_BATCH_SIZE,
            registration_batch_delay: Duration::from_secs(REGISTRATION_BATCH_DELAY_SECS),
            retry: RetryPolicy::default(),
            lock_file: var("EMULATOR_LOCK_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("paraglider_emulator.lock")),
            results_file: var("EMULATOR_RESULTS_FILE")
                .unwrap_or_else(|| "paraglider_simulation_results.json".to_string())
                .into(),
        }
    }

    /// Apply command-line overrides. A manufacturer named on the command
    /// line takes its secret from `var`.
    pub fn with_args(mut self, args: &Args, var: impl Fn(&str) -> Option<String>) -> Self {
        self.devices = args.devices;
        self.duration_minutes = args.duration;
        if let Some(domain) = &args.domain {
            self.domain = domain.clone();
        }
        if let Some(manufacturer) = &args.manufacturer {
            if *manufacturer != self.manufacturer {
                self.manufacturer_secret = var(&secret_var(manufacturer));
                self.manufacturer = manufacturer.clone();
            }
        }
        self.safe_mode = !args.unsafe_mode;
        self.force = args.force;
        self.insecure_tls = args.insecure_tls;
        self.skip_hostname_check = args.skip_hostname_check;
        self
    }

    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}/api/v1", self.domain))
    }

    pub fn mqtt_host(&self) -> &str {
        self.mqtt_host.as_deref().unwrap_or(&self.domain)
    }

    pub fn duration(&self) -> Duration {
        self.duration_override
            .unwrap_or(Duration::from_secs(self.duration_minutes * 60))
    }

    /// Run for an exact wall-clock span instead of whole minutes.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_override = Some(duration);
    }

    /// Seconds between telemetry ticks for each device.
    pub fn update_interval(&self) -> Duration {
        if self.safe_mode {
            self.safe_update_interval
        } else {
            Duration::from_secs(UNSAFE_UPDATE_INTERVAL_SECS)
        }
    }

    pub fn set_update_interval(&mut self, interval: Duration) {
        self.safe_update_interval = interval;
    }

    /// Registration calls per second, `None` when throttling is disabled.
    pub fn api_rate_limit(&self) -> Option<u32> {
        self.safe_mode.then_some(self.api_rate_limit)
    }

    pub fn set_api_rate_limit(&mut self, limit: u32) {
        self.api_rate_limit = limit;
    }

    /// Devices above the threshold share a pool of broker connections.
    pub fn uses_pool(&self) -> bool {
        self.devices > self.dedicated_connection_threshold
    }

    /// Pool size: 5% of the fleet, at least 10 and at most 50 connections.
    pub fn pool_size(&self) -> usize {
        (self.devices / 20).clamp(10, 50)
    }

    /// Check device, duration and update interval bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices < 1 {
            return Err(ConfigError::NoDevices);
        }
        if !self.force && self.devices > self.max_devices {
            return Err(ConfigError::TooManyDevices {
                requested: self.devices,
                limit: self.max_devices,
            });
        }
        if self.duration_minutes < 1 || self.duration_minutes > MAX_DURATION_MINUTES {
            return Err(ConfigError::InvalidDuration(self.duration_minutes));
        }
        if self.update_interval() < MIN_UPDATE_INTERVAL {
            return Err(ConfigError::InvalidUpdateInterval(self.update_interval()));
        }
        Ok(())
    }

    /// The manufacturer secret, from the environment or the saved secrets file.
    pub fn resolve_manufacturer_secret(&self) -> Result<String, ConfigError> {
        if let Some(secret) = self.manufacturer_secret.as_ref().filter(|s| !s.is_empty()) {
            return Ok(secret.clone());
        }
        match load_saved_secret(&self.secrets_file, &self.manufacturer)? {
            Some(secret) => Ok(secret),
            None => Err(ConfigError::MissingSecret {
                manufacturer: self.manufacturer.clone(),
                secrets_file: self.secrets_file.clone(),
            }),
        }
    }

    /// Certificate files that do not exist.
    pub fn missing_certificates(&self) -> Vec<String> {
        [&self.ca_cert, &self.client_cert, &self.client_key]
            .into_iter()
            .filter(|path| !path.exists())
            .map(|path| path.display().to_string())
            .collect()
    }

    /// Fail unless all certificates exist or verification was waived.
    pub fn check_certificates(&self) -> Result<(), ConfigError> {
        let missing = self.missing_certificates();
        if missing.is_empty() || self.insecure_tls {
            Ok(())
        } else {
            Err(ConfigError::MissingCertificates(missing))
        }
    }
}

fn secret_var(manufacturer: &str) -> String {
    format!("MANUFACTURER_SECRET_{}", manufacturer)
}

fn default_secrets_file(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    let config_home = var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"));
    config_home.join("paraglider_emulator").join("secrets.json")
}

#[derive(Debug, Deserialize)]
struct SavedSecrets {
    #[serde(default)]
    manufacturers: HashMap<String, SavedManufacturer>,
}

#[derive(Debug, Deserialize)]
struct SavedManufacturer {
    secret: Option<String>,
}

fn load_saved_secret(path: &Path, manufacturer: &str) -> Result<Option<String>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::SecretsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let saved: SavedSecrets = serde_json::from_str(&raw).map_err(|source| ConfigError::SecretsFormat {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(saved
        .manufacturers
        .get(manufacturer)
        .and_then(|entry| entry.secret.clone())
        .filter(|secret| !secret.is_empty()))
}
