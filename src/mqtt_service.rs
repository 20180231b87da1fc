use crate::config::Settings;
use crate::topics::TopicBuilder;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ClientError, Event, LastWill, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to the MQTT broker")]
    NotConnected,
    #[error("MQTT request queue is full; broker is not draining")]
    QueueFull,
    #[error("MQTT client rejected the request: {0}")]
    Client(ClientError),
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<ClientError> for TransportError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::TryRequest(_) => Self::QueueFull,
            other => Self::Client(other),
        }
    }
}

/// Where the poller and discovery hand their messages.
pub trait Publish {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_credentials: Option<(String, String)>,
    pub mqtt_client_id: String,
    pub keep_alive: Duration,
    pub retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub status_topic: String,
}

impl MqttConfig {
    pub fn from_settings(settings: &Settings, topics: &TopicBuilder) -> Self {
        Self {
            mqtt_host: settings.broker_host.clone(),
            mqtt_port: settings.broker_port,
            mqtt_credentials: settings
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
            mqtt_client_id: format!("sysmon_{}_{}", topics.node_id(), Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(settings.keep_alive_seconds),
            retry_interval_ms: settings.retry_interval_ms,
            max_retry_interval_ms: settings.max_retry_interval_ms,
            status_topic: topics.availability_topic(),
        }
    }
}

/// Reconnect delays: doubling from the initial interval, capped, reset on success.
pub struct Backoff {
    initial_ms: u64,
    max: Duration,
    strategy: ExponentialBackoff,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial_ms = initial_ms.max(2);
        let max = Duration::from_millis(max_ms.max(initial_ms));
        Self {
            initial_ms,
            max,
            strategy: Self::strategy(initial_ms, max),
        }
    }

    // ExponentialBackoff yields factor * 2^n starting at n = 1.
    fn strategy(initial_ms: u64, max: Duration) -> ExponentialBackoff {
        ExponentialBackoff::from_millis(2)
            .factor(initial_ms / 2)
            .max_delay(max)
    }

    pub fn next_delay(&mut self) -> Duration {
        self.strategy.next().unwrap_or(self.max)
    }

    pub fn reset(&mut self) {
        self.strategy = Self::strategy(self.initial_ms, self.max);
    }
}

/// Owns the broker connection. Publishing never waits: while the connection
/// is down every publish fails with [`TransportError::NotConnected`], and a
/// full request queue fails with [`TransportError::QueueFull`].
pub struct MqttPublisher {
    client_state: Mutex<ClientState>,
    client: Mutex<Option<AsyncClient>>,
    shutting_down: AtomicBool,
    pub(crate) config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Arc<Self> {
        Arc::new(Self {
            client_state: Mutex::new(ClientState::Disconnected),
            client: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            config,
        })
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(
            self.config.mqtt_client_id.clone(),
            self.config.mqtt_host.clone(),
            self.config.mqtt_port,
        );
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_last_will(LastWill::new(
            self.config.status_topic.clone(),
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let Some((username, password)) = &self.config.mqtt_credentials {
            mqtt_options.set_credentials(username, password);
        }
        mqtt_options
    }

    /// Connection task: drives the event loop and rebuilds the client after
    /// every transport failure. Runs until [`MqttPublisher::shutdown`].
    pub async fn start(self: Arc<Self>) {
        info!("Starting MQTT service...");

        let mut backoff = Backoff::new(self.config.retry_interval_ms, self.config.max_retry_interval_ms);

        while !self.is_shutting_down() {
            debug!(
                "Configuring MQTT broker at {}:{}...",
                self.config.mqtt_host, self.config.mqtt_port
            );

            let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), 10);
            self.install_client(client).await;

            loop {
                match eventloop.poll().await {
                    Ok(event) => {
                        if self.handle_event(&event).await {
                            backoff.reset();
                            self.announce(STATUS_ONLINE).await;
                        }
                    }
                    Err(e) => {
                        if self.is_shutting_down() {
                            debug!("MQTT event loop stopped: {:?}", e);
                        } else {
                            error!("Error in MQTT event loop: {:?}", e);
                        }
                        self.connection_lost().await;
                        break;
                    }
                }
            }

            if self.is_shutting_down() {
                break;
            }

            let retry_interval = backoff.next_delay();
            warn!(
                "Lost connection to MQTT broker. Retrying in {:?}...",
                retry_interval
            );
            sleep(retry_interval).await;
        }

        info!("MQTT service stopped.");
    }

    async fn install_client(&self, client: AsyncClient) {
        *self.client.lock().await = Some(client);
        *self.client_state.lock().await = ClientState::Connecting;
    }

    async fn connection_lost(&self) {
        *self.client_state.lock().await = ClientState::Disconnected;
        *self.client.lock().await = None;
    }

    /// Returns true when the event completed a connection handshake.
    async fn handle_event(&self, event: &Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!(
                    "Connected to MQTT broker at {}:{} ({:?}).",
                    self.config.mqtt_host, self.config.mqtt_port, ack.code
                );
                *self.client_state.lock().await = ClientState::Connected;
                true
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker closed the MQTT session.");
                false
            }
            Event::Outgoing(outgoing) => {
                debug!("Outgoing event: {:?}", outgoing);
                false
            }
            _ => {
                debug!("Unhandled event: {:?}", event);
                false
            }
        }
    }

    async fn announce(&self, status: &str) {
        if let Err(e) = self.publish(&self.config.status_topic, status, true).await {
            warn!("Failed to publish status '{}': {}", status, e);
        }
    }

    pub async fn is_connected(&self) -> bool {
        *self.client_state.lock().await == ClientState::Connected
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Publish the offline status and close the session. The connection task
    /// exits instead of reconnecting.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.announce(STATUS_OFFLINE).await;

        if let Some(client) = self.current_client().await {
            if let Err(e) = client.try_disconnect() {
                warn!("Failed to disconnect from MQTT broker: {:?}", e);
            }
        }
    }

    // The lock is never held across a send.
    async fn current_client(&self) -> Option<AsyncClient> {
        self.client.lock().await.clone()
    }
}

impl Publish for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        if !self.is_connected().await {
            return Err(TransportError::NotConnected);
        }

        let client = self.current_client().await.ok_or(TransportError::NotConnected)?;
        client.try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())?;
        debug!("Message published to '{}': {}", topic, payload);
        Ok(())
    }
}
