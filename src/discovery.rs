//! Home Assistant MQTT discovery.
//!
//! One retained config message per active sensor. The broker keeps them, so
//! republishing is harmless. Sensors disabled later keep their stale entry on
//! the broker; nothing here removes it.

use crate::models::{DeviceInfo, DiscoveryDescriptor, Metric, SWITCH_OFF, SWITCH_ON};
use crate::mqtt_service::{Publish, TransportError};
use crate::topics::TopicBuilder;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

pub struct DiscoveryPublisher {
    topics: TopicBuilder,
    device: DeviceInfo,
    republish_every: Option<Duration>,
    pacing: Duration,
    last_sent: Option<Instant>,
}

impl DiscoveryPublisher {
    pub fn new(topics: TopicBuilder, republish_every: Option<Duration>) -> Self {
        let device = DeviceInfo::for_host(topics.node_id());
        Self {
            topics,
            device,
            republish_every,
            pacing: DEFAULT_PACING,
            last_sent: None,
        }
    }

    /// Delay between two discovery messages.
    #[cfg(test)]
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn descriptor(&self, metric: Metric) -> DiscoveryDescriptor {
        let (payload_on, payload_off) = match metric.component() {
            "binary_sensor" => (Some(SWITCH_ON), Some(SWITCH_OFF)),
            _ => (None, None),
        };

        DiscoveryDescriptor {
            name: format!("{} {}", self.topics.node_id(), metric.display_name()),
            unique_id: self.topics.unique_id(metric),
            object_id: self.topics.unique_id(metric),
            state_topic: self.topics.state_topic(metric),
            availability_topic: self.topics.availability_topic(),
            unit_of_measurement: metric.unit(),
            device_class: metric.device_class(),
            state_class: metric.state_class(),
            payload_on,
            payload_off,
            icon: metric.icon(),
            device: self.device.clone(),
        }
    }

    pub fn has_sent(&self) -> bool {
        self.last_sent.is_some()
    }

    /// Nothing sent yet, or the republish interval has elapsed.
    pub fn is_due(&self, now: Instant) -> bool {
        match (self.last_sent, self.republish_every) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(sent), Some(every)) => now.duration_since(sent) >= every,
        }
    }

    /// Publish one retained descriptor per discoverable metric, stopping at
    /// the first transport failure so the whole batch is retried next time.
    pub async fn publish<P: Publish>(&mut self, publisher: &P, metrics: &[Metric]) -> Result<usize, TransportError> {
        let metrics: Vec<Metric> = metrics.iter().copied().filter(|m| m.discoverable()).collect();
        if !metrics.is_empty() {
            info!("Sending Home Assistant discovery messages...");
        }

        for (i, metric) in metrics.iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() {
                sleep(self.pacing).await;
            }
            let topic = self.topics.discovery_topic(*metric);
            let payload = serde_json::to_string(&self.descriptor(*metric))?;
            publisher.publish(&topic, &payload, true).await?;
            debug!("Discovery config for '{}' sent to '{}'", metric, topic);
        }

        self.last_sent = Some(Instant::now());
        if !metrics.is_empty() {
            info!("Home Assistant discovery messages sent ({} sensors)", metrics.len());
        }
        Ok(metrics.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory broker stand-in.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) messages: Mutex<Vec<(String, String, bool)>>,
        pub(crate) offline: Mutex<bool>,
        pub(crate) rejected_suffix: Mutex<Option<&'static str>>,
    }

    impl RecordingPublisher {
        pub(crate) fn set_offline(&self, offline: bool) {
            *self.offline.lock().unwrap() = offline;
        }

        pub(crate) fn reject_topics_ending_with(&self, suffix: &'static str) {
            *self.rejected_suffix.lock().unwrap() = Some(suffix);
        }

        pub(crate) fn topics(&self) -> Vec<String> {
            self.messages.lock().unwrap().iter().map(|(t, _, _)| t.clone()).collect()
        }
    }

    impl Publish for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
            if *self.offline.lock().unwrap() {
                return Err(TransportError::NotConnected);
            }
            if let Some(suffix) = *self.rejected_suffix.lock().unwrap() {
                if topic.ends_with(suffix) {
                    return Err(TransportError::QueueFull);
                }
            }
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string(), retain));
            Ok(())
        }
    }

    fn discovery() -> DiscoveryPublisher {
        DiscoveryPublisher::new(TopicBuilder::new("home", "homeassistant", "pi1"), None)
            .with_pacing(Duration::ZERO)
    }

    #[test]
    fn test_temperature_descriptor() {
        let descriptor = discovery().descriptor(Metric::CpuTemperature);
        assert_eq!(descriptor.unique_id, "pi1_cpu_temperature");
        assert_eq!(descriptor.unit_of_measurement, Some("°C"));
        assert_eq!(descriptor.device_class, Some("temperature"));
        assert_eq!(descriptor.state_topic, "home/pi1/cpu_temperature");
        assert_eq!(descriptor.name, "pi1 CPU Temperature");
    }

    #[test]
    fn test_descriptor_json_omits_absent_fields() {
        let json: serde_json::Value =
            serde_json::to_value(discovery().descriptor(Metric::LoadAverage)).unwrap();
        assert!(json.get("unit_of_measurement").is_none());
        assert!(json.get("payload_on").is_none());
        assert_eq!(json["device"]["identifiers"][0], "sysmon_pi1");
        assert_eq!(json["availability_topic"], "home/pi1/status");
    }

    #[test]
    fn test_fan_descriptor_is_binary() {
        let json = serde_json::to_value(discovery().descriptor(Metric::FanStatus)).unwrap();
        assert_eq!(json["payload_on"], "ON");
        assert_eq!(json["payload_off"], "OFF");
    }

    #[tokio::test]
    async fn test_publishes_one_retained_message_per_metric() {
        let publisher = RecordingPublisher::default();
        let mut discovery = discovery();
        let sent = discovery
            .publish(&publisher, &[Metric::CpuUsage, Metric::CpuTemperature])
            .await
            .unwrap();
        assert_eq!(sent, 2);

        let messages = publisher.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|(_, _, retain)| *retain));
        assert_eq!(messages[1].0, "homeassistant/sensor/pi1_cpu_temperature/config");
    }

    #[tokio::test]
    async fn test_no_metrics_no_messages() {
        let publisher = RecordingPublisher::default();
        let mut discovery = discovery();
        assert_eq!(discovery.publish(&publisher, &[]).await.unwrap(), 0);
        assert!(publisher.messages.lock().unwrap().is_empty());
        assert!(!discovery.is_due(Instant::now()));
    }

    #[tokio::test]
    async fn test_failed_publish_stays_due() {
        let publisher = RecordingPublisher::default();
        publisher.set_offline(true);
        let mut discovery = discovery();
        assert!(discovery.publish(&publisher, &[Metric::Uptime]).await.is_err());
        assert!(discovery.is_due(Instant::now()));
        assert!(!discovery.has_sent());
    }

    #[tokio::test]
    async fn test_periodic_republish() {
        let publisher = RecordingPublisher::default();
        let mut discovery = DiscoveryPublisher::new(
            TopicBuilder::new("home", "homeassistant", "pi1"),
            Some(Duration::from_secs(300)),
        )
        .with_pacing(Duration::ZERO);
        discovery.publish(&publisher, &[Metric::Uptime]).await.unwrap();
        let now = Instant::now();
        assert!(!discovery.is_due(now));
        assert!(discovery.is_due(now + Duration::from_secs(301)));
    }
}
