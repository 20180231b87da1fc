use serde::{Serialize, Serializer};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Every metric the monitor knows how to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    CpuUsage,
    CpuTemperature,
    LoadAverage,
    MemoryUsage,
    MemoryUsed,
    MemoryTotal,
    DiskUsage,
    DiskUsed,
    DiskTotal,
    NetworkRx,
    NetworkTx,
    Uptime,
    FanStatus,
}

impl Metric {
    pub const ALL: [Metric; 13] = [
        Metric::CpuUsage,
        Metric::CpuTemperature,
        Metric::LoadAverage,
        Metric::MemoryUsage,
        Metric::MemoryUsed,
        Metric::MemoryTotal,
        Metric::DiskUsage,
        Metric::DiskUsed,
        Metric::DiskTotal,
        Metric::NetworkRx,
        Metric::NetworkTx,
        Metric::Uptime,
        Metric::FanStatus,
    ];

    /// Topic segment and JSON key for this metric.
    pub fn key(self) -> &'static str {
        match self {
            Metric::CpuUsage => "cpu_usage",
            Metric::CpuTemperature => "cpu_temperature",
            Metric::LoadAverage => "load_average",
            Metric::MemoryUsage => "memory_usage",
            Metric::MemoryUsed => "memory_used",
            Metric::MemoryTotal => "memory_total",
            Metric::DiskUsage => "disk_usage",
            Metric::DiskUsed => "disk_used",
            Metric::DiskTotal => "disk_total",
            Metric::NetworkRx => "network_rx",
            Metric::NetworkTx => "network_tx",
            Metric::Uptime => "uptime",
            Metric::FanStatus => "fan_status",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Metric::CpuUsage => "CPU Usage",
            Metric::CpuTemperature => "CPU Temperature",
            Metric::LoadAverage => "Load Average",
            Metric::MemoryUsage => "Memory Usage",
            Metric::MemoryUsed => "Memory Used",
            Metric::MemoryTotal => "Memory Total",
            Metric::DiskUsage => "Disk Usage",
            Metric::DiskUsed => "Disk Used",
            Metric::DiskTotal => "Disk Total",
            Metric::NetworkRx => "Network Bytes Received",
            Metric::NetworkTx => "Network Bytes Sent",
            Metric::Uptime => "Uptime",
            Metric::FanStatus => "Case Fan",
        }
    }

    pub fn unit(self) -> Option<&'static str> {
        match self {
            Metric::CpuUsage | Metric::MemoryUsage | Metric::DiskUsage => Some("%"),
            Metric::CpuTemperature => Some("°C"),
            Metric::MemoryUsed | Metric::MemoryTotal | Metric::DiskUsed | Metric::DiskTotal => Some("GB"),
            Metric::NetworkRx | Metric::NetworkTx => Some("B"),
            Metric::Uptime => Some("h"),
            Metric::LoadAverage | Metric::FanStatus => None,
        }
    }

    pub fn device_class(self) -> Option<&'static str> {
        match self {
            Metric::CpuTemperature => Some("temperature"),
            Metric::MemoryUsed | Metric::MemoryTotal | Metric::DiskUsed | Metric::DiskTotal => {
                Some("data_size")
            }
            Metric::NetworkRx | Metric::NetworkTx => Some("data_size"),
            Metric::Uptime => Some("duration"),
            Metric::FanStatus => Some("running"),
            _ => None,
        }
    }

    pub fn state_class(self) -> Option<&'static str> {
        match self {
            Metric::NetworkRx | Metric::NetworkTx | Metric::Uptime => Some("total_increasing"),
            Metric::FanStatus => None,
            _ => Some("measurement"),
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Metric::CpuUsage => "mdi:cpu-64-bit",
            Metric::CpuTemperature => "mdi:thermometer",
            Metric::LoadAverage => "mdi:chart-line",
            Metric::MemoryUsage | Metric::MemoryUsed | Metric::MemoryTotal => "mdi:memory",
            Metric::DiskUsage | Metric::DiskUsed | Metric::DiskTotal => "mdi:harddisk",
            Metric::NetworkRx => "mdi:download-network",
            Metric::NetworkTx => "mdi:upload-network",
            Metric::Uptime => "mdi:clock-outline",
            Metric::FanStatus => "mdi:fan",
        }
    }

    /// Capacities only change with hardware, so the hub gets no entity for
    /// them; they still appear on their state topic and in the aggregate.
    pub fn discoverable(self) -> bool {
        !matches!(self, Metric::MemoryTotal | Metric::DiskTotal)
    }

    /// Home Assistant entity platform used in the discovery topic.
    pub fn component(self) -> &'static str {
        match self {
            Metric::FanStatus => "binary_sensor",
            _ => "sensor",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorValue {
    Gauge(f64),
    Counter(u64),
    Switch(bool),
}

pub const SWITCH_ON: &str = "ON";
pub const SWITCH_OFF: &str = "OFF";

impl SensorValue {
    /// Plain-text payload for the per-metric state topic.
    pub fn to_payload(&self) -> String {
        match self {
            SensorValue::Gauge(v) => v.to_string(),
            SensorValue::Counter(v) => v.to_string(),
            SensorValue::Switch(true) => SWITCH_ON.to_string(),
            SensorValue::Switch(false) => SWITCH_OFF.to_string(),
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload())
    }
}

impl Serialize for SensorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SensorValue::Gauge(v) => serializer.serialize_f64(*v),
            SensorValue::Counter(v) => serializer.serialize_u64(*v),
            SensorValue::Switch(on) => serializer.serialize_str(if *on { SWITCH_ON } else { SWITCH_OFF }),
        }
    }
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone)]
pub struct SensorReading {
    pub metric: Metric,
    pub value: SensorValue,
    pub unit: Option<&'static str>,
    pub timestamp: OffsetDateTime,
}

impl SensorReading {
    pub fn new(metric: Metric, value: SensorValue) -> Self {
        Self {
            metric,
            value,
            unit: metric.unit(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub sw_version: String,
}

impl DeviceInfo {
    pub fn for_host(hostname: &str) -> Self {
        Self {
            identifiers: vec![format!("sysmon_{}", hostname)],
            name: format!("System Monitor {}", hostname),
            model: std::env::consts::ARCH.to_string(),
            manufacturer: env!("CARGO_PKG_NAME").to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Retained Home Assistant discovery payload for one sensor.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDescriptor {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub state_topic: String,
    pub availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<&'static str>,
    pub icon: &'static str,
    pub device: DeviceInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_keys_are_unique() {
        let mut keys: Vec<_> = Metric::ALL.iter().map(|m| m.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), Metric::ALL.len());
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(12.345, 1), 12.3);
        assert_eq!(round_to(12.35, 2), 12.35);
        assert_eq!(round_to(99.96, 1), 100.0);
    }

    #[test]
    fn test_payload_rendering() {
        assert_eq!(SensorValue::Gauge(42.5).to_payload(), "42.5");
        assert_eq!(SensorValue::Counter(1024).to_payload(), "1024");
        assert_eq!(SensorValue::Switch(true).to_payload(), "ON");
        assert_eq!(SensorValue::Switch(false).to_payload(), "OFF");
    }

    #[test]
    fn test_value_serializes_to_json_scalar() {
        let json = serde_json::to_string(&SensorValue::Switch(false)).unwrap();
        assert_eq!(json, "\"OFF\"");
        let json = serde_json::to_string(&SensorValue::Counter(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_fan_is_binary_sensor() {
        assert_eq!(Metric::FanStatus.component(), "binary_sensor");
        assert_eq!(Metric::CpuTemperature.component(), "sensor");
        assert_eq!(Metric::CpuTemperature.unit(), Some("°C"));
    }

    #[test]
    fn test_capacities_are_not_discovered() {
        let hidden: Vec<_> = Metric::ALL.iter().filter(|m| !m.discoverable()).collect();
        assert_eq!(hidden, [&Metric::MemoryTotal, &Metric::DiskTotal]);
        assert_eq!(Metric::DiskTotal.unit(), Some("GB"));
    }
}
