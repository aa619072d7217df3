//! MQTT transport backed by `rumqttc`.
//!
//! One client connection per transport. Subscriptions are kept in a local
//! table and replayed on every `ConnAck`, since the broker forgets them when
//! a clean session reconnects. The replay runs on its own task: the client's
//! request channel is only drained by the event loop, so the loop must never
//! wait on it.
//!
//! Acknowledgements are manual: a QoS 1 message is only acked once mission
//! control is done with it. Messages no handler claims are acked right away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, SubscribeFilter};
use thingbridge_core::{CancellationToken, Error, Result};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{InboundMessage, MessageHandler, SubscriptionTable, Transport};

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Capacity of the client's request channel.
const REQUEST_CAPACITY: usize = 64;

/// Filters per SUBSCRIBE packet when restoring subscriptions.
const SUBSCRIBE_BATCH: usize = 32;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_manual_acks(true);

        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user, pass);
        }
        options
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    broker: String,
}

impl MqttTransport {
    /// Create the client and spawn its event loop.
    ///
    /// The connection is established in the background; operations issued
    /// before it is up are queued by the client. The event loop stops when
    /// `shutdown` fires.
    pub fn connect(settings: &MqttSettings, shutdown: CancellationToken) -> Self {
        let (client, eventloop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
        let broker = format!("{}:{}", settings.host, settings.port);

        let transport = Self {
            client,
            subscriptions: Arc::new(SubscriptionTable::default()),
            tasks: TaskTracker::new(),
            shutdown,
            broker,
        };
        transport.spawn_event_loop(eventloop);

        info!(
            broker = %transport.broker,
            client_id = %settings.client_id,
            "Connecting to MQTT broker"
        );
        transport
    }

    fn spawn_event_loop(&self, mut eventloop: EventLoop) {
        let client = self.client.clone();
        let subscriptions = self.subscriptions.clone();
        let tasks = self.tasks.clone();
        let shutdown = self.shutdown.clone();
        let broker = self.broker.clone();

        self.tasks.spawn(async move {
            let mut error_count: u32 = 0;

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = eventloop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        error_count = 0;
                        dispatch(&client, &subscriptions, &tasks, publish);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        error_count = 0;
                        info!(broker = %broker, "MQTT connection acknowledged");
                        restore_subscriptions(&client, &subscriptions, &tasks);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error_count = error_count.saturating_add(1);
                        warn!(
                            broker = %broker,
                            attempt = error_count,
                            "MQTT connection error: {}",
                            e
                        );

                        // rumqttc reconnects on the next poll
                        let backoff = Duration::from_secs(u64::from(error_count.min(30)));
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }

            // nothing polls the channel any more; waiting on it would hang
            if let Err(e) = client.try_disconnect() {
                debug!(broker = %broker, "MQTT disconnect failed: {}", e);
            }
            drop(eventloop);
            info!(broker = %broker, "MQTT event loop stopped");
        });
    }

    /// Stop the event loop and wait for in-flight message handlers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn dispatch(
    client: &AsyncClient,
    subscriptions: &SubscriptionTable,
    tasks: &TaskTracker,
    publish: Publish,
) {
    let handlers = subscriptions.handlers_for(&publish.topic);
    if handlers.is_empty() {
        // in flight while its subscription was dropped
        debug!(topic = %publish.topic, "No handler for MQTT message, acking");
        let client = client.clone();
        tasks.spawn(async move {
            if let Err(e) = client.ack(&publish).await {
                warn!(topic = %publish.topic, "Failed to acknowledge message: {}", e);
            }
        });
        return;
    }

    let message = InboundMessage::new(publish.topic.to_string(), publish.payload.to_vec())
        .with_duplicate(publish.dup)
        .with_delivery(publish.pkid, publish.qos as u8);

    for handler in handlers {
        tasks.spawn(handler(message.clone()));
    }
}

/// Replay the subscription table from a separate task.
fn restore_subscriptions(
    client: &AsyncClient,
    subscriptions: &SubscriptionTable,
    tasks: &TaskTracker,
) {
    let batches = subscribe_batches(subscriptions.filters());
    if batches.is_empty() {
        return;
    }

    let client = client.clone();
    tasks.spawn(async move {
        for batch in batches {
            let count = batch.len();
            if let Err(e) = client.subscribe_many(batch).await {
                error!(filters = count, "Failed to restore MQTT subscriptions: {}", e);
            }
        }
    });
}

fn subscribe_batches(filters: Vec<String>) -> Vec<Vec<SubscribeFilter>> {
    filters
        .chunks(SUBSCRIBE_BATCH)
        .map(|chunk| {
            chunk
                .iter()
                .map(|filter| SubscribeFilter::new(filter.clone(), QoS::AtLeastOnce))
                .collect()
        })
        .collect()
}

fn qos_from_u8(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::Transport(format!("invalid QoS level {}", other))),
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        self.subscriptions.insert(topic, handler);

        if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
            self.subscriptions.remove(topic);
            return Err(Error::Transport(format!("subscribe to {} failed: {}", topic, e)));
        }

        debug!(topic = %topic, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        let mut failed = Vec::new();

        for topic in topics {
            self.subscriptions.remove(topic);
            if let Err(e) = self.client.unsubscribe(topic.as_str()).await {
                warn!(topic = %topic, "Failed to unsubscribe: {}", e);
                failed.push(topic.as_str());
            }
        }

        if !failed.is_empty() {
            return Err(Error::Transport(format!(
                "unsubscribe failed for {}",
                failed.join(", ")
            )));
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| Error::Transport(format!("publish to {} failed: {}", topic, e)))
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        if !message.claim_ack() {
            return Ok(());
        }

        let qos = qos_from_u8(message.qos)?;
        let mut publish = Publish::new(message.topic.as_str(), qos, Vec::<u8>::new());
        publish.pkid = message.packet_id;

        self.client
            .ack(&publish)
            .await
            .map_err(|e| Error::Transport(format!("ack of {} failed: {}", message.topic, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message_handler;

    fn client(capacity: usize) -> (AsyncClient, EventLoop) {
        let settings = MqttSettings::new("localhost", DEFAULT_PORT, "thingbridge-test");
        AsyncClient::new(settings.options(), capacity)
    }

    fn table(filters: usize) -> SubscriptionTable {
        let table = SubscriptionTable::default();
        for i in 0..filters {
            table.insert(&format!("thing{}/status/on", i), message_handler(|_| async {}));
        }
        table
    }

    #[tokio::test]
    async fn test_restoring_many_subscriptions_does_not_block() {
        // the event loop is never polled, so nothing drains the channel
        let (client, _eventloop) = client(4);
        let subscriptions = table(100);
        let tasks = TaskTracker::new();

        restore_subscriptions(&client, &subscriptions, &tasks);

        tasks.close();
        tokio::time::timeout(Duration::from_secs(5), tasks.wait())
            .await
            .expect("restore blocked on the request channel");

        // 100 filters went out as 4 SUBSCRIBE requests and filled the channel
        assert!(client.try_subscribe("extra", QoS::AtLeastOnce).is_err());
    }

    #[test]
    fn test_subscribe_batches() {
        let filters: Vec<String> = (0..70).map(|i| format!("t/{}", i)).collect();
        let batches = subscribe_batches(filters);
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![32, 32, 6]
        );
        assert_eq!(batches[2][5].path, "t/69");

        assert!(subscribe_batches(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_message_is_acked() {
        let (client, _eventloop) = client(1);
        let tasks = TaskTracker::new();

        let mut publish = Publish::new("gone/status/on", QoS::AtLeastOnce, "ON");
        publish.pkid = 7;
        dispatch(&client, &SubscriptionTable::default(), &tasks, publish);

        tasks.close();
        tokio::time::timeout(Duration::from_secs(5), tasks.wait())
            .await
            .expect("ack was not sent");

        // the PUBACK occupies the only slot
        assert!(client.try_subscribe("extra", QoS::AtLeastOnce).is_err());
    }

    #[tokio::test]
    async fn test_unrouted_qos0_message_needs_no_ack() {
        let (client, _eventloop) = client(1);
        let tasks = TaskTracker::new();

        dispatch(
            &client,
            &SubscriptionTable::default(),
            &tasks,
            Publish::new("gone/status/on", QoS::AtMostOnce, "ON"),
        );

        tasks.close();
        tasks.wait().await;
        assert!(client.try_subscribe("extra", QoS::AtLeastOnce).is_ok());
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_u8(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_u8(3).is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = MqttSettings::new("localhost", DEFAULT_PORT, "thingbridge");
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert!(settings.username.is_none());
    }
}
