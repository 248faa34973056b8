//! MQTT gateway
//!
//! Wraps a `rumqttc` client with the delivery rules the portal relies on:
//! QoS 1 everywhere, a persistent broker session, manual acknowledgements
//! issued only after the handler has processed a message, and reconnects
//! with exponential backoff.

use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Stable client id, required for the broker to keep the session
    pub client_id: String,
    pub keep_alive: Duration,
    /// Upper bound on handing a publish to the client
    pub publish_timeout: Duration,
}

impl MqttConfig {
    /// Create a new MqttConfig with default timings
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(5),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(false);
        options.set_manual_acks(true);
        if let Some(username) = self.username.as_ref().filter(|u| !u.is_empty()) {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// What to do with an inbound message once the handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Processed or permanently rejected; acknowledge it
    Ack,
    /// Transient failure; leave unacknowledged so the broker redelivers
    Redeliver,
}

/// Receives inbound messages from the event loop, one at a time
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &[u8]) -> Delivery;
}

/// Outbound side of the bus
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a JSON payload at QoS 1
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> BusResult<()>;

    /// Whether the broker connection is currently up
    fn is_connected(&self) -> bool;
}

/// Publisher used when no broker is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePublisher;

#[async_trait]
impl Publisher for OfflinePublisher {
    async fn publish(&self, _topic: &str, _payload: &serde_json::Value) -> BusResult<()> {
        Err(BusError::Disconnected)
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Cloneable handle for publishing through the broker connection
#[derive(Clone)]
pub struct MqttGateway {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    publish_timeout: Duration,
}

/// The connection driver; must be run for the gateway to do anything
pub struct MqttEventLoop {
    event_loop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    subscriptions: Vec<String>,
}

impl MqttGateway {
    /// Create the gateway and its event loop
    ///
    /// `subscriptions` are (re)issued on every successful connect.
    pub fn connect(config: &MqttConfig, subscriptions: Vec<String>) -> (Self, MqttEventLoop) {
        let (client, event_loop) = AsyncClient::new(config.options(), 64);
        let connected = Arc::new(AtomicBool::new(false));

        let gateway = Self {
            client: client.clone(),
            connected: connected.clone(),
            publish_timeout: config.publish_timeout,
        };
        let driver = MqttEventLoop {
            event_loop,
            client,
            connected,
            subscriptions,
        };
        (gateway, driver)
    }
}

#[async_trait]
impl Publisher for MqttGateway {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        let bytes = serde_json::to_vec(payload).map_err(BusError::Encode)?;

        tokio::time::timeout(
            self.publish_timeout,
            self.client.publish(topic, QoS::AtLeastOnce, false, bytes),
        )
        .await
        .map_err(|_| BusError::Timeout(self.publish_timeout))?
        .map_err(BusError::Publish)?;

        debug!(topic, "Published MQTT message");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl MqttEventLoop {
    /// Drive the connection forever, dispatching publishes to `handler`
    pub async fn run<H>(mut self, handler: Arc<H>)
    where
        H: MessageHandler + ?Sized,
    {
        let mut backoff = MIN_BACKOFF;

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(session_present = ack.session_present, "MQTT connected");
                    self.connected.store(true, Ordering::SeqCst);
                    backoff = MIN_BACKOFF;
                    self.subscribe_all();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let delivery = handler.on_message(&publish.topic, &publish.payload).await;
                    match delivery {
                        Delivery::Ack => {
                            if let Err(e) = self.client.try_ack(&publish) {
                                error!("Failed to acknowledge {}: {}", publish.topic, e);
                            }
                        }
                        Delivery::Redeliver => {
                            warn!(topic = %publish.topic, "Leaving message unacknowledged for redelivery");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT broker sent disconnect");
                    self.connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        warn!("MQTT connection lost: {}", e);
                    } else {
                        warn!("MQTT connect failed: {}", e);
                    }
                    info!("Reconnecting to MQTT in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    fn subscribe_all(&self) {
        for topic in &self.subscriptions {
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => info!(topic = %topic, "Subscribed"),
                Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
            }
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
