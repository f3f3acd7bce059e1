//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionHostKind {
    Log,
    Mqtt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { base_url: default_base_url(), timeout_ms: default_timeout_ms() }
    }
}

fn default_base_url() -> String {
    "https://api.commute.aremac.tech".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// How long a fetched snapshot is reused for position-triggered cycles
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

fn default_freshness_secs() -> u64 {
    30
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Distance below which a crossing is "within gate" (meters)
    #[serde(default = "default_gate_threshold_m")]
    pub gate_threshold_m: f64,
    #[serde(default = "default_nominal_speed_mps")]
    pub nominal_speed_mps: f64,
    /// Out-of-gate cycles tolerated before the session is ended
    #[serde(default = "default_grace_cycles")]
    pub grace_cycles: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            gate_threshold_m: default_gate_threshold_m(),
            nominal_speed_mps: default_nominal_speed_mps(),
            grace_cycles: default_grace_cycles(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_gate_threshold_m() -> f64 {
    1_600.0
}

fn default_nominal_speed_mps() -> f64 {
    15.0
}

fn default_grace_cycles() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_session_host")]
    pub host: SessionHostKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { stale_after_secs: default_stale_after_secs(), host: default_session_host() }
    }
}

fn default_stale_after_secs() -> u64 {
    15 * 60
}

fn default_session_host() -> SessionHostKind {
    SessionHostKind::Log
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic_prefix: default_topic_prefix(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "crossing/session".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsConfig {
    #[serde(default = "default_gps_device")]
    pub device: String,
    #[serde(default = "default_gps_baud")]
    pub baud: u32,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self { device: default_gps_device(), baud: default_gps_baud() }
    }
}

fn default_gps_device() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_gps_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Metrics/control HTTP port (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), http_port: default_http_port() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_http_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub gps: GpsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_base_url: String,
    service_timeout_ms: u64,
    freshness_secs: u64,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
    poll_interval_secs: u64,
    gate_threshold_m: f64,
    nominal_speed_mps: f64,
    grace_cycles: u32,
    stale_after_secs: u64,
    session_host: SessionHostKind,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic_prefix: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    gps_device: String,
    gps_baud: u32,
    metrics_interval_secs: u64,
    http_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            service_base_url: toml_config.service.base_url,
            service_timeout_ms: toml_config.service.timeout_ms,
            freshness_secs: toml_config.directory.freshness_secs,
            backoff_base_ms: toml_config.directory.backoff_base_ms,
            backoff_cap_ms: toml_config.directory.backoff_cap_ms,
            poll_interval_secs: toml_config.monitor.poll_interval_secs,
            gate_threshold_m: toml_config.monitor.gate_threshold_m,
            nominal_speed_mps: toml_config.monitor.nominal_speed_mps,
            grace_cycles: toml_config.monitor.grace_cycles,
            stale_after_secs: toml_config.session.stale_after_secs,
            session_host: toml_config.session.host,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic_prefix: toml_config.mqtt.topic_prefix,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            gps_device: toml_config.gps.device,
            gps_baud: toml_config.gps.baud,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            http_port: toml_config.metrics.http_port,
            config_file,
        }
    }

    /// Config file path: the `--config` flag, then `CONFIG_FILE`, then the dev default
    pub fn resolve_config_path(flag: Option<String>) -> String {
        flag.or_else(|| env::var("CONFIG_FILE").ok())
            .unwrap_or_else(|| "config/dev.toml".to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        anyhow::ensure!(
            toml_config.monitor.nominal_speed_mps > 0.0,
            "monitor.nominal_speed_mps must be positive in {}",
            path.display()
        );
        anyhow::ensure!(
            toml_config.monitor.poll_interval_secs > 0,
            "monitor.poll_interval_secs must be positive in {}",
            path.display()
        );

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn service_base_url(&self) -> &str {
        &self.service_base_url
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn gate_threshold_m(&self) -> f64 {
        self.gate_threshold_m
    }

    pub fn nominal_speed_mps(&self) -> f64 {
        self.nominal_speed_mps
    }

    pub fn grace_cycles(&self) -> u32 {
        self.grace_cycles
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn session_host(&self) -> &SessionHostKind {
        &self.session_host
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic_prefix(&self) -> &str {
        &self.mqtt_topic_prefix
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn gps_device(&self) -> &str {
        &self.gps_device
    }

    pub fn gps_baud(&self) -> u32 {
        self.gps_baud
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to change the grace cycles
    #[cfg(test)]
    pub fn with_grace_cycles(mut self, cycles: u32) -> Self {
        self.grace_cycles = cycles;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.freshness(), Duration::from_secs(30));
        assert_eq!(config.backoff_base(), Duration::from_secs(2));
        assert_eq!(config.backoff_cap(), Duration::from_secs(60));
        assert_eq!(config.gate_threshold_m(), 1600.0);
        assert_eq!(config.nominal_speed_mps(), 15.0);
        assert_eq!(config.grace_cycles(), 1);
        assert_eq!(config.stale_after(), Duration::from_secs(900));
        assert_eq!(config.session_host(), &SessionHostKind::Log);
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_resolve_config_path_default() {
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_flag_wins() {
        assert_eq!(
            Config::resolve_config_path(Some("config/car.toml".to_string())),
            "config/car.toml"
        );
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[monitor]
gate_threshold_m = 800.0

[session]
host = "mqtt"
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.gate_threshold_m(), 800.0);
        assert_eq!(config.nominal_speed_mps(), 15.0);
        assert_eq!(config.session_host(), &SessionHostKind::Mqtt);
        assert_eq!(config.mqtt_topic_prefix(), "crossing/session");
    }
}
