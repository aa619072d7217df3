//! Publish/subscribe transports.
//!
//! Mission control only needs four operations from a transport: subscribe a
//! handler to a topic filter, drop a batch of subscriptions, publish and
//! acknowledge. [`MqttTransport`] implements them on top of an MQTT broker,
//! [`LoopbackTransport`] in process for tests and dry runs.

pub mod loopback;
#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thingbridge_core::Result;

pub use loopback::{LoopbackTransport, PublishedMessage};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttSettings, MqttTransport};

/// A message delivered by the transport.
///
/// Clones share their acknowledgement state: whichever clone is acked first
/// acks the message, later acks are no-ops.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker redelivers a message it already sent.
    pub duplicate: bool,
    pub packet_id: u16,
    pub qos: u8,
    acked: Arc<AtomicBool>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            duplicate: false,
            packet_id: 0,
            qos: 0,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_duplicate(mut self, duplicate: bool) -> Self {
        self.duplicate = duplicate;
        self
    }

    pub fn with_delivery(mut self, packet_id: u16, qos: u8) -> Self {
        self.packet_id = packet_id;
        self.qos = qos;
        self
    }

    /// Marks the message as acknowledged. Returns `true` only for the first
    /// call, which is the one that must send the acknowledgement.
    pub fn claim_ack(&self) -> bool {
        !self.acked.swap(true, Ordering::AcqRel)
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

/// Callback invoked for every message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe `handler` to a topic filter. Subscribing the same filter
    /// again replaces the previous handler.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()>;

    /// Drop the subscriptions of all `topics`.
    async fn unsubscribe(&self, topics: &[String]) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    /// Acknowledge a delivered message.
    async fn ack(&self, message: &InboundMessage) -> Result<()>;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Topic filters and their handlers.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: RwLock<Vec<(String, MessageHandler)>>,
}

impl SubscriptionTable {
    pub(crate) fn insert(&self, filter: &str, handler: MessageHandler) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|(f, _)| f == filter) {
            Some(entry) => entry.1 = handler,
            None => entries.push((filter.to_string(), handler)),
        }
    }

    pub(crate) fn remove(&self, filter: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(f, _)| f != filter);
        entries.len() != before
    }

    pub(crate) fn filters(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// Handlers of every filter matching `topic`.
    pub(crate) fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(f, _)| topic_matches(f, topic))
            .map(|(_, h)| h.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("lamp1/status/on", "lamp1/status/on"));
        assert!(topic_matches("lamp1/status/+", "lamp1/status/on"));
        assert!(topic_matches("+/status/+", "lamp1/status/on"));
        assert!(topic_matches("lamp1/#", "lamp1/status/on"));
        assert!(topic_matches("#", "lamp1"));

        assert!(!topic_matches("lamp1/status", "lamp1/status/on"));
        assert!(!topic_matches("lamp1/status/on", "lamp1/status"));
        assert!(!topic_matches("lamp1/+", "lamp1/status/on"));
        assert!(!topic_matches("lamp2/status/on", "lamp1/status/on"));
    }

    #[test]
    fn test_ack_is_claimed_once_across_clones() {
        let message = InboundMessage::new("a/b", b"x".to_vec());
        let copy = message.clone();

        assert!(!message.is_acked());
        assert!(copy.claim_ack());
        assert!(!message.claim_ack());
        assert!(message.is_acked());
    }

    #[test]
    fn test_subscription_table_replaces_handler() {
        let table = SubscriptionTable::default();
        table.insert("a/+", message_handler(|_| async {}));
        table.insert("a/+", message_handler(|_| async {}));
        table.insert("b/#", message_handler(|_| async {}));

        assert_eq!(table.filters(), vec!["a/+".to_string(), "b/#".to_string()]);
        assert_eq!(table.handlers_for("a/x").len(), 1);
        assert!(table.remove("a/+"));
        assert!(!table.remove("a/+"));
        assert!(table.handlers_for("a/x").is_empty());
    }
}
