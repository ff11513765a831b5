//! MQTT transport.
//!
//! The core only needs two things from the broker: a way to publish status
//! events ([`MessageBus`]) and a stream of inbound messages on the trigger
//! topic ([`run_event_loop`]). Reconnection is driven here by re-polling the
//! rumqttc event loop after a backoff delay.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::reconnect::ReconnectPolicy;

/// Capacity of the request channel between [`AsyncClient`] and [`EventLoop`].
const REQUEST_CHANNEL_CAPACITY: usize = 16;

/// How long to keep polling after a disconnect request so queued status
/// events reach the broker before the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Publishing half of the message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), BusError>;
}

#[async_trait]
impl MessageBus for AsyncClient {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), BusError> {
        AsyncClient::publish(self, topic, qos, false, payload.to_vec()).await?;
        Ok(())
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Build the MQTT client and its (not yet connected) event loop.
pub fn connect(config: &Config) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.as_str(),
        config.mqtt_host.as_str(),
        config.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.as_str(),
            config.mqtt_password.as_deref().unwrap_or_default(),
        );
    }
    AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY)
}

/// Subscription owed to the broker since the last ConnAck.
///
/// `try_subscribe` fails while the request channel is full; the request is
/// retried after every poll until it is queued.
#[derive(Debug)]
struct Subscription {
    topic: String,
    pending: bool,
}

impl Subscription {
    fn new(topic: String) -> Self {
        Self {
            topic,
            pending: false,
        }
    }

    fn on_connack(&mut self, client: &AsyncClient) {
        self.pending = true;
        self.retry(client);
    }

    /// Non-blocking: awaiting here would wait on the channel the event loop
    /// drains.
    fn retry(&mut self, client: &AsyncClient) {
        if !self.pending {
            return;
        }
        match client.try_subscribe(self.topic.as_str(), QoS::AtLeastOnce) {
            Ok(()) => self.pending = false,
            Err(e) => {
                tracing::warn!(error = %e, topic = %self.topic, "Subscribe not queued yet, retrying")
            }
        }
    }
}

/// Drive the MQTT event loop until `token` is cancelled.
///
/// Subscribes to `topic` on every (re)connect and forwards each inbound
/// publish to `tx`. The channel is unbounded so a slow consumer can never
/// stall polling, which would also stall our own outbound publishes.
pub async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
    policy: ReconnectPolicy,
    token: CancellationToken,
) {
    let mut failures = 0u32;
    let mut subscription = Subscription::new(topic);

    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                tracing::info!(topic = %subscription.topic, "Connected to MQTT broker, subscribing");
                subscription.on_connack(&client);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, "Subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(topic = %publish.topic, bytes = publish.payload.len(), "Message received");
                let msg = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if tx.send(msg).is_err() {
                    tracing::warn!("Dispatcher has stopped, leaving event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                subscription.pending = false;
                let delay = policy.delay_for_attempt(failures);
                failures = failures.saturating_add(1);
                tracing::error!(
                    error = %e,
                    attempt = failures,
                    "MQTT connection error, reconnecting in {}s",
                    delay.as_secs()
                );
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        }
        subscription.retry(&client);
    }

    drain(&client, &mut eventloop).await;
}

/// Ask the broker for a clean disconnect and flush whatever is still queued.
async fn drain(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.try_disconnect().is_err() {
        return;
    }
    let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while eventloop.poll().await.is_ok() {}
    })
    .await;
    if flushed.is_err() {
        tracing::debug!("Timed out flushing MQTT event loop");
    }
    tracing::info!("Disconnected from MQTT broker");
}
