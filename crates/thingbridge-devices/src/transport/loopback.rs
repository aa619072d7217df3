//! In-process transport.
//!
//! Messages are injected by the caller and delivered to matching handlers
//! before [`LoopbackTransport::inject`] returns. Publishes, unsubscribes and
//! acks are recorded for inspection.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thingbridge_core::{Error, Result};

use super::{InboundMessage, MessageHandler, SubscriptionTable, Transport};

/// A message handed to [`Transport::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
pub struct LoopbackTransport {
    subscriptions: SubscriptionTable,
    published: Mutex<Vec<PublishedMessage>>,
    unsubscribed: Mutex<Vec<Vec<String>>>,
    acks: AtomicUsize,
    next_packet_id: AtomicU16,
    fail_publish: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a fresh QoS 1 message to every matching handler. Returns the
    /// number of handlers that received it.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let message = InboundMessage::new(topic, payload).with_delivery(packet_id, 1);
        self.deliver(message).await
    }

    /// Deliver a prepared message to every matching handler.
    pub async fn deliver(&self, message: InboundMessage) -> usize {
        let handlers = self.subscriptions.handlers_for(&message.topic);
        for handler in &handlers {
            handler(message.clone()).await;
        }
        handlers.len()
    }

    /// Currently subscribed topic filters, in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.filters()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Topic batches passed to `unsubscribe`, one entry per call.
    pub fn unsubscribe_calls(&self) -> Vec<Vec<String>> {
        self.unsubscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of acknowledgements sent.
    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::Acquire)
    }

    /// Make every following publish fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Release);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        self.subscriptions.insert(topic, handler);
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        for topic in topics {
            self.subscriptions.remove(topic);
        }
        self.unsubscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topics.to_vec());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if self.fail_publish.load(Ordering::Acquire) {
            return Err(Error::Transport(format!("publish to {} rejected", topic)));
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                retain,
            });
        Ok(())
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        if message.claim_ack() {
            self.acks.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}
