use crate::config::Settings;
use crate::discovery::DiscoveryPublisher;
use crate::models::{Metric, SensorReading, SensorValue};
use crate::mqtt_service::Publish;
use crate::samplers::{MetricSource, SamplerError};
use crate::topics::TopicBuilder;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Sampling,
    Publishing,
    Sleeping,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub sampled: usize,
    pub failed: usize,
    pub published: usize,
    pub dropped: usize,
}

pub struct Poller<S, P> {
    source: S,
    publisher: Arc<P>,
    topics: TopicBuilder,
    metrics: Vec<Metric>,
    discovery: Option<DiscoveryPublisher>,
    interval: Duration,
    retain: bool,
    state: PollState,
}

impl<S: MetricSource, P: Publish> Poller<S, P> {
    /// Active metrics are the enabled ones the source can provide, fixed for
    /// the lifetime of the process.
    pub fn new(source: S, publisher: Arc<P>, topics: TopicBuilder, settings: &Settings) -> Self {
        let metrics: Vec<Metric> = settings
            .enabled_metrics()
            .into_iter()
            .filter(|m| {
                let supported = source.supports(*m);
                if !supported {
                    warn!("Metric '{}' is enabled but not available on this host", m);
                }
                supported
            })
            .collect();

        let discovery = settings.enable_discovery.then(|| {
            DiscoveryPublisher::new(
                topics.clone(),
                settings.discovery_interval_seconds.map(Duration::from_secs),
            )
        });

        Self {
            source,
            publisher,
            topics,
            metrics,
            discovery,
            interval: Duration::from_secs(settings.interval_seconds),
            retain: settings.retain,
            state: PollState::Idle,
        }
    }

    #[cfg(test)]
    pub fn with_discovery(mut self, discovery: Option<DiscoveryPublisher>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    #[cfg(test)]
    pub fn state(&self) -> PollState {
        self.state
    }

    fn transition(&mut self, next: PollState) {
        trace!("Poll state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Never returns; stopped by dropping the future on shutdown.
    pub async fn run(mut self) {
        info!(
            "Starting system monitor for '{}' ({} metrics, interval: {:?})",
            self.topics.node_id(),
            self.metrics.len(),
            self.interval
        );

        let warm_up = self.source.warm_up();
        if !warm_up.is_zero() {
            debug!("Waiting {:?} for the first CPU baseline", warm_up);
            sleep(warm_up).await;
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.transition(PollState::Idle);
            self.run_cycle().await;
            self.transition(PollState::Sleeping);
        }
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.transition(PollState::Sampling);
        let mut report = CycleReport::default();
        let readings = self.sample_all(&mut report);

        // Sampling can take a while; the broker may have come up meanwhile.
        let discovered = self.publish_discovery_if_due().await;

        if readings.is_empty() {
            debug!("No readings this cycle; nothing to publish");
            self.transition(PollState::Idle);
            return report;
        }

        self.transition(PollState::Publishing);
        let messages = self.build_messages(&readings);
        let total = messages.len();
        if !discovered {
            report.dropped = total;
            warn!("Dropping {} messages of this cycle: discovery still pending", total);
            self.transition(PollState::Idle);
            return report;
        }

        for (topic, payload) in messages {
            match self.publisher.publish(&topic, &payload, self.retain).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    report.dropped = total - report.published;
                    warn!("Dropping {} messages of this cycle: {}", report.dropped, e);
                    break;
                }
            }
        }

        if report.dropped == 0 {
            info!(
                "Published {} messages ({} sampled, {} failed): {}",
                report.published,
                report.sampled,
                report.failed,
                summary(&readings)
            );
        }
        self.transition(PollState::Idle);
        report
    }

    /// Returns false while the first discovery round has not gone out, so
    /// no state message can reach the hub ahead of it.
    async fn publish_discovery_if_due(&mut self) -> bool {
        let Some(discovery) = self.discovery.as_mut() else {
            return true;
        };
        if discovery.is_due(Instant::now()) {
            if let Err(e) = discovery.publish(&*self.publisher, &self.metrics).await {
                warn!("Discovery not sent, retrying next cycle: {}", e);
            }
        }
        discovery.has_sent()
    }

    fn sample_all(&mut self, report: &mut CycleReport) -> Vec<SensorReading> {
        let mut readings = Vec::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            match self.source.sample(*metric) {
                Ok(value) => {
                    report.sampled += 1;
                    let reading = SensorReading::new(*metric, value);
                    debug!("{} = {}{}", metric, reading.value, reading.unit.unwrap_or(""));
                    readings.push(reading);
                }
                Err(SamplerError::Unavailable(_)) => {
                    report.failed += 1;
                    debug!("Skipping '{}': not available right now", metric);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to sample '{}': {}", metric, e);
                }
            }
        }
        readings
    }

    /// One scalar message per reading, then the aggregate JSON document.
    fn build_messages(&self, readings: &[SensorReading]) -> Vec<(String, String)> {
        let mut messages: Vec<(String, String)> = readings
            .iter()
            .map(|r| (self.topics.state_topic(r.metric), r.value.to_payload()))
            .collect();

        match aggregate_payload(readings) {
            Ok(payload) => messages.push((self.topics.aggregate_topic(), payload)),
            Err(e) => warn!("Skipping aggregate state message: {}", e),
        }
        messages
    }
}

fn aggregate_payload(readings: &[SensorReading]) -> Result<String, serde_json::Error> {
    let mut state = Map::new();
    for reading in readings {
        state.insert(reading.metric.key().to_string(), serde_json::to_value(reading.value)?);
    }
    if let Some(first) = readings.first() {
        state.insert("timestamp".to_string(), Value::String(first.timestamp_rfc3339()));
    }
    serde_json::to_string(&Value::Object(state))
}

fn summary(readings: &[SensorReading]) -> String {
    let find = |metric: Metric| {
        readings
            .iter()
            .find(|r| r.metric == metric)
            .map(|r| r.value.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    };
    let mut line = format!(
        "CPU={}%, Temp={}°C, Memory={}%, Disk={}%",
        find(Metric::CpuUsage),
        find(Metric::CpuTemperature),
        find(Metric::MemoryUsage),
        find(Metric::DiskUsage)
    );
    if let Some(fan) = readings.iter().find(|r| r.metric == Metric::FanStatus) {
        if let SensorValue::Switch(on) = fan.value {
            line.push_str(if on { ", Fan=ON" } else { ", Fan=OFF" });
        }
    }
    line
}
