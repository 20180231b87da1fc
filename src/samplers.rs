//! Metric samplers backed by `sysinfo` and a couple of single-value OS reads.

use crate::config::Settings;
use crate::models::{round_to, Metric, SensorValue};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use thiserror::Error;
use tracing::{debug, info, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("{0} is not available on this host")]
    Unavailable(Metric),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {what} from {raw:?}")]
    Parse { what: &'static str, raw: String },
    #[error("command failed: {0}")]
    Command(String),
}

/// Something that can turn a [`Metric`] into a current value.
pub trait MetricSource {
    /// Whether this host can provide the metric at all.
    fn supports(&self, _metric: Metric) -> bool {
        true
    }

    fn sample(&mut self, metric: Metric) -> Result<SensorValue, SamplerError>;

    /// Time to wait before the first sample is meaningful.
    fn warm_up(&self) -> Duration {
        Duration::ZERO
    }
}

/// Reads the local machine.
pub struct SystemSampler {
    system: System,
    disks: Disks,
    networks: Networks,
    disk_mount: PathBuf,
    thermal_zone: PathBuf,
    fan: Option<FanProbe>,
    cpu_baseline: Instant,
}

impl SystemSampler {
    pub fn new(settings: &Settings) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; take the baseline now.
        system.refresh_cpu_usage();

        let fan = if settings.enable_fan_status {
            FanProbe::detect(settings.fan_gpio_pin)
        } else {
            None
        };

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            disk_mount: settings.disk_mount.clone(),
            thermal_zone: settings.thermal_zone.clone(),
            fan,
            cpu_baseline: Instant::now(),
        }
    }

    fn cpu_usage(&mut self) -> SensorValue {
        self.system.refresh_cpu_usage();
        let usage = (self.system.global_cpu_usage() as f64).clamp(0.0, 100.0);
        SensorValue::Gauge(round_to(usage, 1))
    }

    fn cpu_temperature(&self) -> Result<SensorValue, SamplerError> {
        read_millidegrees(&self.thermal_zone).map(|c| SensorValue::Gauge(round_to(c, 1)))
    }

    fn memory(&mut self, metric: Metric) -> Result<SensorValue, SamplerError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        if total == 0 {
            return Err(SamplerError::Unavailable(metric));
        }
        Ok(match metric {
            Metric::MemoryUsed => SensorValue::Gauge(round_to(used as f64 / BYTES_PER_GB, 2)),
            Metric::MemoryTotal => SensorValue::Gauge(round_to(total as f64 / BYTES_PER_GB, 2)),
            _ => SensorValue::Gauge(percent(used, total)),
        })
    }

    fn disk(&mut self, metric: Metric) -> Result<SensorValue, SamplerError> {
        self.disks.refresh(true);
        let disk = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == self.disk_mount.as_path())
            .ok_or(SamplerError::Unavailable(metric))?;

        let total = disk.total_space();
        let used = total.saturating_sub(disk.available_space());
        if total == 0 {
            return Err(SamplerError::Unavailable(metric));
        }
        Ok(match metric {
            Metric::DiskUsed => SensorValue::Gauge(round_to(used as f64 / BYTES_PER_GB, 2)),
            Metric::DiskTotal => SensorValue::Gauge(round_to(total as f64 / BYTES_PER_GB, 2)),
            _ => SensorValue::Gauge(percent(used, total)),
        })
    }

    /// Byte totals since boot across all non-loopback interfaces.
    fn network(&mut self, metric: Metric) -> SensorValue {
        self.networks.refresh(true);
        let total = self
            .networks
            .list()
            .iter()
            .filter(|(name, _)| !is_loopback(name))
            .map(|(_, data)| match metric {
                Metric::NetworkTx => data.total_transmitted(),
                _ => data.total_received(),
            })
            .fold(0u64, u64::saturating_add);
        SensorValue::Counter(total)
    }

    fn fan_status(&self) -> Result<SensorValue, SamplerError> {
        let fan = self
            .fan
            .as_ref()
            .ok_or(SamplerError::Unavailable(Metric::FanStatus))?;
        fan.read().map(SensorValue::Switch)
    }
}

impl MetricSource for SystemSampler {
    /// The first CPU reading is only a real delta once sysinfo's minimum
    /// update interval has passed since the baseline refresh.
    fn warm_up(&self) -> Duration {
        MINIMUM_CPU_UPDATE_INTERVAL.saturating_sub(self.cpu_baseline.elapsed())
    }

    fn supports(&self, metric: Metric) -> bool {
        match metric {
            Metric::FanStatus => self.fan.is_some(),
            _ => true,
        }
    }

    fn sample(&mut self, metric: Metric) -> Result<SensorValue, SamplerError> {
        match metric {
            Metric::CpuUsage => Ok(self.cpu_usage()),
            Metric::CpuTemperature => self.cpu_temperature(),
            Metric::LoadAverage => Ok(SensorValue::Gauge(round_to(System::load_average().one, 2))),
            Metric::MemoryUsage | Metric::MemoryUsed | Metric::MemoryTotal => self.memory(metric),
            Metric::DiskUsage | Metric::DiskUsed | Metric::DiskTotal => self.disk(metric),
            Metric::NetworkRx | Metric::NetworkTx => Ok(self.network(metric)),
            Metric::Uptime => Ok(SensorValue::Gauge(round_to(System::uptime() as f64 / 3600.0, 1))),
            Metric::FanStatus => self.fan_status(),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    round_to((used as f64 / total as f64 * 100.0).clamp(0.0, 100.0), 1)
}

fn is_loopback(interface: &str) -> bool {
    interface == "lo" || interface == "lo0"
}

/// Thermal zone files hold the temperature in millidegrees Celsius.
fn read_millidegrees(path: &Path) -> Result<f64, SamplerError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SamplerError::Unavailable(Metric::CpuTemperature))
        }
        Err(source) => {
            return Err(SamplerError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    parse_millidegrees(&raw)
}

fn parse_millidegrees(raw: &str) -> Result<f64, SamplerError> {
    raw.trim()
        .parse::<f64>()
        .map(|milli| milli / 1000.0)
        .map_err(|_| SamplerError::Parse {
            what: "temperature",
            raw: raw.trim().to_string(),
        })
}

/// Reads the fan GPIO level through `pinctrl`.
#[derive(Debug, Clone)]
pub struct FanProbe {
    pin: u8,
}

impl FanProbe {
    /// Returns `None` (after logging why) when `pinctrl` cannot read the pin.
    pub fn detect(pin: u8) -> Option<Self> {
        let probe = Self { pin };
        match probe.run() {
            Ok(_) => {
                info!("Fan monitoring enabled on GPIO pin {} (using pinctrl)", pin);
                Some(probe)
            }
            Err(e) => {
                warn!("Fan monitoring disabled for GPIO pin {}: {}", pin, e);
                None
            }
        }
    }

    fn run(&self) -> Result<String, SamplerError> {
        let output = Command::new("pinctrl")
            .arg("get")
            .arg(self.pin.to_string())
            .output()
            .map_err(|e| SamplerError::Command(format!("pinctrl: {}", e)))?;

        if !output.status.success() {
            return Err(SamplerError::Command(format!(
                "pinctrl get {} exited with {}: {}",
                self.pin,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn read(&self) -> Result<bool, SamplerError> {
        let output = self.run()?;
        debug!("pinctrl output for pin {}: {}", self.pin, output);
        parse_pin_level(&output).ok_or(SamplerError::Parse {
            what: "pin level",
            raw: output,
        })
    }
}

/// Parse lines such as `14: op -- pn | hi // GPIO14 = output`.
pub fn parse_pin_level(output: &str) -> Option<bool> {
    let lower = output.to_lowercase();
    if lower.contains("| hi") {
        Some(true)
    } else if lower.contains("| lo") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(extra: &str) -> Settings {
        Settings::from_json5(&format!("{{ broker_host: \"localhost\", {} }}", extra)).unwrap()
    }

    #[test]
    fn test_parse_pin_level() {
        assert_eq!(parse_pin_level("14: ip    -- | hi // GPIO14 = input"), Some(true));
        assert_eq!(parse_pin_level("14: op -- pn | lo // GPIO14 = output"), Some(false));
        assert_eq!(parse_pin_level("14: OP -- PN | HI // GPIO14 = output"), Some(true));
        assert_eq!(parse_pin_level("garbage"), None);
    }

    #[test]
    fn test_parse_millidegrees() {
        assert_eq!(parse_millidegrees("48312\n").unwrap(), 48.312);
        assert!(matches!(
            parse_millidegrees("hot"),
            Err(SamplerError::Parse { what: "temperature", .. })
        ));
    }

    #[test]
    fn test_missing_thermal_zone_is_unavailable() {
        let settings = settings(r#"thermal_zone: "/nonexistent/thermal/temp""#);
        let mut sampler = SystemSampler::new(&settings);
        assert!(matches!(
            sampler.sample(Metric::CpuTemperature),
            Err(SamplerError::Unavailable(Metric::CpuTemperature))
        ));
    }

    #[test]
    fn test_thermal_zone_file_is_read() {
        let path = std::env::temp_dir().join(format!("sysmon-temp-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "51234\n").unwrap();
        let settings = settings(&format!("thermal_zone: {:?}", path.display().to_string()));
        let mut sampler = SystemSampler::new(&settings);
        assert_eq!(sampler.sample(Metric::CpuTemperature).unwrap(), SensorValue::Gauge(51.2));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_cpu_usage_is_a_percentage() {
        let mut sampler = SystemSampler::new(&settings(""));
        match sampler.sample(Metric::CpuUsage).unwrap() {
            SensorValue::Gauge(v) => assert!((0.0..=100.0).contains(&v)),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_unknown_mount_is_unavailable() {
        let settings = settings(r#"disk_mount: "/definitely/not/mounted""#);
        let mut sampler = SystemSampler::new(&settings);
        assert!(matches!(
            sampler.sample(Metric::DiskUsage),
            Err(SamplerError::Unavailable(Metric::DiskUsage))
        ));
    }

    #[test]
    fn test_fan_disabled_is_unsupported() {
        let sampler = SystemSampler::new(&settings("enable_fan_status: false"));
        assert!(!sampler.supports(Metric::FanStatus));
        assert!(sampler.supports(Metric::CpuUsage));
    }

    #[test]
    fn test_network_counters() {
        let mut sampler = SystemSampler::new(&settings(""));
        assert!(matches!(sampler.sample(Metric::NetworkRx), Ok(SensorValue::Counter(_))));
        assert!(matches!(sampler.sample(Metric::NetworkTx), Ok(SensorValue::Counter(_))));
    }

    #[test]
    fn test_memory_total_covers_used() {
        let mut sampler = SystemSampler::new(&settings(""));
        let (Ok(SensorValue::Gauge(used)), Ok(SensorValue::Gauge(total))) =
            (sampler.sample(Metric::MemoryUsed), sampler.sample(Metric::MemoryTotal))
        else {
            panic!("memory gauges expected");
        };
        assert!(total > 0.0);
        assert!(used <= total);
    }

    #[test]
    fn test_warm_up_waits_for_cpu_baseline() {
        let sampler = SystemSampler::new(&settings(""));
        assert!(sampler.warm_up() <= MINIMUM_CPU_UPDATE_INTERVAL);

        std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
        assert_eq!(sampler.warm_up(), Duration::ZERO);
    }
}
