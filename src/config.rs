use crate::models::Metric;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.json5";

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Absent or "auto" means detect from the OS.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_true")]
    pub enable_discovery: bool,
    #[serde(default)]
    pub discovery_interval_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub retain: bool,

    #[serde(default = "default_true")]
    pub enable_cpu_usage: bool,
    #[serde(default = "default_true")]
    pub enable_cpu_temperature: bool,
    #[serde(default = "default_true")]
    pub enable_load_average: bool,
    #[serde(default = "default_true")]
    pub enable_memory_usage: bool,
    #[serde(default = "default_true")]
    pub enable_memory_used: bool,
    #[serde(default = "default_true")]
    pub enable_memory_total: bool,
    #[serde(default = "default_true")]
    pub enable_disk_usage: bool,
    #[serde(default = "default_true")]
    pub enable_disk_used: bool,
    #[serde(default = "default_true")]
    pub enable_disk_total: bool,
    #[serde(default = "default_true")]
    pub enable_network_rx: bool,
    #[serde(default = "default_true")]
    pub enable_network_tx: bool,
    #[serde(default = "default_true")]
    pub enable_uptime: bool,
    #[serde(default)]
    pub enable_fan_status: bool,

    #[serde(default = "default_fan_gpio_pin")]
    pub fan_gpio_pin: u8,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,
    #[serde(default = "default_thermal_zone")]
    pub thermal_zone: PathBuf,

    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_max_retry_interval_ms")]
    pub max_retry_interval_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_broker_port() -> u16 {
    1883
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_topic_prefix() -> String {
    "home".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_fan_gpio_pin() -> u8 {
    14
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_thermal_zone() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

fn default_keep_alive_seconds() -> u64 {
    60
}

fn default_retry_interval_ms() -> u64 {
    5000
}

fn default_max_retry_interval_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

const SAMPLE_CONFIG: &str = r#"// sysmon-mqtt configuration (JSON5)
{
  // MQTT broker
  broker_host: "192.168.1.100",
  broker_port: 1883,
  // username: "monitor",
  // password: "secret",

  // Seconds between two samples
  interval_seconds: 60,
  // Leave out or set to "auto" to use the system hostname
  hostname: "auto",
  topic_prefix: "home",

  // Home Assistant auto-discovery
  enable_discovery: true,
  discovery_prefix: "homeassistant",

  enable_cpu_usage: true,
  enable_cpu_temperature: true,
  enable_load_average: true,
  enable_memory_usage: true,
  enable_memory_used: true,
  enable_memory_total: true,
  enable_disk_usage: true,
  enable_disk_used: true,
  enable_disk_total: true,
  enable_network_rx: true,
  enable_network_tx: true,
  enable_uptime: true,

  // Fan state is read with `pinctrl get <pin>`
  enable_fan_status: false,
  fan_gpio_pin: 14,

  // trace, debug, info, warn, error
  log_level: "info",
}
"#;

impl Settings {
    /// Validate ranges and cross-field constraints.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_host must not be empty".to_string()));
        }
        if self.interval_seconds == 0 {
            return Err(ConfigError::Invalid("interval_seconds must be > 0".to_string()));
        }
        if self.discovery_interval_seconds == Some(0) {
            return Err(ConfigError::Invalid(
                "discovery_interval_seconds must be > 0 when set".to_string(),
            ));
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.retry_interval_ms) {
            return Err(ConfigError::Invalid(format!(
                "retry_interval_ms must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.max_retry_interval_ms < self.retry_interval_ms {
            return Err(ConfigError::Invalid(
                "max_retry_interval_ms must not be smaller than retry_interval_ms".to_string(),
            ));
        }
        if self.keep_alive_seconds == 0 {
            return Err(ConfigError::Invalid("keep_alive_seconds must be > 0".to_string()));
        }
        for (name, value) in [("topic_prefix", &self.topic_prefix), ("discovery_prefix", &self.discovery_prefix)] {
            if value.is_empty() || value.contains(['+', '#']) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be non-empty and free of MQTT wildcards",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate a JSON5 document without touching the environment.
    #[cfg(test)]
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = json5::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load the file at `path`, apply `MQTT_*` environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Settings = json5::from_str(&content)?;

        dotenv().ok(); // Load environment variables from .env file
        settings.apply_overrides(|key| env::var(key).ok())?;

        settings.validate()?;
        Ok(settings)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.broker_host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker_port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid("MQTT_PORT must be a valid port number".to_string()))?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.password = Some(password);
        }
        Ok(())
    }

    /// Write a commented sample file. Never overwrites.
    pub fn write_sample<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_err)?;
        std::io::Write::write_all(&mut file, SAMPLE_CONFIG.as_bytes()).map_err(io_err)
    }

    /// Credentials are only sent when both parts are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    /// Hostname from the config, or the OS hostname when unset or "auto".
    pub fn resolve_hostname(&self) -> String {
        match self.hostname.as_deref() {
            Some(name) if !name.is_empty() && name != "auto" => name.to_string(),
            _ => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    pub fn is_enabled(&self, metric: Metric) -> bool {
        match metric {
            Metric::CpuUsage => self.enable_cpu_usage,
            Metric::CpuTemperature => self.enable_cpu_temperature,
            Metric::LoadAverage => self.enable_load_average,
            Metric::MemoryUsage => self.enable_memory_usage,
            Metric::MemoryUsed => self.enable_memory_used,
            Metric::MemoryTotal => self.enable_memory_total,
            Metric::DiskUsage => self.enable_disk_usage,
            Metric::DiskUsed => self.enable_disk_used,
            Metric::DiskTotal => self.enable_disk_total,
            Metric::NetworkRx => self.enable_network_rx,
            Metric::NetworkTx => self.enable_network_tx,
            Metric::Uptime => self.enable_uptime,
            Metric::FanStatus => self.enable_fan_status,
        }
    }

    pub fn enabled_metrics(&self) -> Vec<Metric> {
        Metric::ALL.into_iter().filter(|m| self.is_enabled(*m)).collect()
    }
}
