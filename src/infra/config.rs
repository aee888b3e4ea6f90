//! Configuration loading from TOML files
//!
//! The binary selects the file via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! A missing or invalid file falls back to defaults with a warning.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpsSourceKind {
    Gpsd,
    Nmea,
}

impl GpsSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpsSourceKind::Gpsd => "gpsd",
            GpsSourceKind::Nmea => "nmea",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Device identifier (metrics label, MQTT client id)
    #[serde(default = "default_agent_id")]
    pub id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { id: default_agent_id() }
    }
}

fn default_agent_id() -> String {
    "smartbus-agent".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the REST API, e.g. https://host/api (may embed user:pass@)
    pub base_url: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_topic_prefix() -> String {
    "smartbus".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_keep_alive_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsConfig {
    #[serde(default = "default_gps_source")]
    pub source: GpsSourceKind,
    #[serde(default = "default_gpsd_addr")]
    pub gpsd_addr: String,
    #[serde(default = "default_serial_device")]
    pub serial_device: String,
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
    /// Nominal sampling cadence
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Minimum displacement before a new fix is reported
    #[serde(default = "default_min_distance_m")]
    pub min_distance_m: f64,
    /// Delay before restarting the sampler after a sensor failure
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Silence on the sensor stream longer than this is a failure
    #[serde(default = "default_fix_timeout_ms")]
    pub fix_timeout_ms: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            source: default_gps_source(),
            gpsd_addr: default_gpsd_addr(),
            serial_device: default_serial_device(),
            serial_baud: default_serial_baud(),
            interval_ms: default_interval_ms(),
            min_distance_m: default_min_distance_m(),
            restart_delay_ms: default_restart_delay_ms(),
            fix_timeout_ms: default_fix_timeout_ms(),
        }
    }
}

fn default_gps_source() -> GpsSourceKind {
    GpsSourceKind::Gpsd
}

fn default_gpsd_addr() -> String {
    "127.0.0.1:2947".to_string()
}

fn default_serial_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_serial_baud() -> u32 {
    9600
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_min_distance_m() -> f64 {
    5.0
}

fn default_restart_delay_ms() -> u64 {
    5000
}

fn default_fix_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Status/metrics HTTP port (0 to disable)
    #[serde(default)]
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), http_port: 0 }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    pub backend: BackendConfig,
    pub live: LiveConfig,
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    agent_id: String,
    backend_url: String,
    backend_timeout_ms: u64,
    live_host: String,
    live_port: u16,
    live_topic_prefix: String,
    live_username: Option<String>,
    live_password: Option<String>,
    live_handshake_timeout_ms: u64,
    live_reconnect_attempts: u32,
    live_reconnect_delay_ms: u64,
    live_keep_alive_secs: u64,
    gps_source: GpsSourceKind,
    gpsd_addr: String,
    serial_device: String,
    serial_baud: u32,
    sample_interval_ms: u64,
    min_distance_m: f64,
    restart_delay_ms: u64,
    fix_timeout_ms: u64,
    metrics_interval_secs: u64,
    metrics_http_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            backend_url: "http://localhost:3000/api".to_string(),
            backend_timeout_ms: default_backend_timeout_ms(),
            live_host: "localhost".to_string(),
            live_port: 1883,
            live_topic_prefix: default_topic_prefix(),
            live_username: None,
            live_password: None,
            live_handshake_timeout_ms: default_handshake_timeout_ms(),
            live_reconnect_attempts: default_reconnect_attempts(),
            live_reconnect_delay_ms: default_reconnect_delay_ms(),
            live_keep_alive_secs: default_keep_alive_secs(),
            gps_source: default_gps_source(),
            gpsd_addr: default_gpsd_addr(),
            serial_device: default_serial_device(),
            serial_baud: default_serial_baud(),
            sample_interval_ms: default_interval_ms(),
            min_distance_m: default_min_distance_m(),
            restart_delay_ms: default_restart_delay_ms(),
            fix_timeout_ms: default_fix_timeout_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
            metrics_http_port: 0,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            agent_id: toml_config.agent.id,
            backend_url: toml_config.backend.base_url,
            backend_timeout_ms: toml_config.backend.timeout_ms,
            live_host: toml_config.live.host,
            live_port: toml_config.live.port,
            live_topic_prefix: toml_config.live.topic_prefix,
            live_username: toml_config.live.username,
            live_password: toml_config.live.password,
            live_handshake_timeout_ms: toml_config.live.handshake_timeout_ms,
            live_reconnect_attempts: toml_config.live.reconnect_attempts,
            live_reconnect_delay_ms: toml_config.live.reconnect_delay_ms,
            live_keep_alive_secs: toml_config.live.keep_alive_secs,
            gps_source: toml_config.gps.source,
            gpsd_addr: toml_config.gps.gpsd_addr,
            serial_device: toml_config.gps.serial_device,
            serial_baud: toml_config.gps.serial_baud,
            sample_interval_ms: toml_config.gps.interval_ms,
            min_distance_m: toml_config.gps.min_distance_m,
            restart_delay_ms: toml_config.gps.restart_delay_ms,
            fix_timeout_ms: toml_config.gps.fix_timeout_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            metrics_http_port: toml_config.metrics.http_port,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn live_host(&self) -> &str {
        &self.live_host
    }

    pub fn live_port(&self) -> u16 {
        self.live_port
    }

    pub fn live_topic_prefix(&self) -> &str {
        &self.live_topic_prefix
    }

    pub fn live_username(&self) -> Option<&str> {
        self.live_username.as_deref()
    }

    pub fn live_password(&self) -> Option<&str> {
        self.live_password.as_deref()
    }

    pub fn live_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.live_handshake_timeout_ms)
    }

    pub fn live_reconnect_attempts(&self) -> u32 {
        self.live_reconnect_attempts
    }

    pub fn live_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.live_reconnect_delay_ms)
    }

    pub fn live_keep_alive(&self) -> Duration {
        Duration::from_secs(self.live_keep_alive_secs)
    }

    pub fn gps_source(&self) -> GpsSourceKind {
        self.gps_source
    }

    pub fn gpsd_addr(&self) -> &str {
        &self.gpsd_addr
    }

    pub fn serial_device(&self) -> &str {
        &self.serial_device
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn min_distance_m(&self) -> f64 {
        self.min_distance_m
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.fix_timeout_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn metrics_http_port(&self) -> u16 {
        self.metrics_http_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to point at a mock backend
    #[cfg(test)]
    pub fn with_backend_url(mut self, url: &str) -> Self {
        self.backend_url = url.to_string();
        self
    }

    /// Builder method for tests to point at a local broker
    #[cfg(test)]
    pub fn with_live_endpoint(mut self, host: &str, port: u16) -> Self {
        self.live_host = host.to_string();
        self.live_port = port;
        self
    }
}
