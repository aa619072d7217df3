//! Mission control: keeps transport subscriptions in sync with the registry.
//!
//! Every stored thing gets a subscription on its connection topic and one per
//! property status topic. Status reports are parsed with the property's
//! payload handler and appended to the property's value store. Registry
//! notifications add and drop subscriptions while running.

use std::sync::{Arc, Weak};

use serde_json::Value;
use thingbridge_core::thing::{DEFAULT_SET_PAYLOAD, DEFAULT_SET_TOPIC};
use thingbridge_core::{
    render_template, CancellationToken, Error, HandlerRegistry, ResolvedHandler, Result, Thing,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::registry::{notifier, Registry};
use crate::transport::{message_handler, InboundMessage, Transport};

struct Inner {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    handlers: Arc<HandlerRegistry>,
    tasks: TaskTracker,
}

/// Wires the registry to the transport.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct MissionControl {
    inner: Arc<Inner>,
}

impl MissionControl {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                handlers,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Set up every stored thing and start following registry changes.
    ///
    /// Must be called once. Fails if a stored thing cannot be set up.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let things = self.inner.registry.all(cancel).await?;
        info!(things = things.len(), "Starting mission control");

        for thing in things {
            self.inner.setup_thing(thing).await?;
        }

        self.register_notifiers();
        Ok(())
    }

    /// Run until `shutdown` fires.
    ///
    /// In-flight notification work is awaited before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.start(&shutdown).await?;

        shutdown.cancelled().await;
        info!("Mission control shutting down");

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        Ok(())
    }

    fn register_notifiers(&self) {
        let registry = &self.inner.registry;

        let weak = Arc::downgrade(&self.inner);
        registry.register_created_notifier(notifier(move |thing: Arc<Thing>| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let tasks = inner.tasks.clone();
                tasks
                    .track_future(async move {
                        if let Err(e) = inner.setup_thing(thing.clone()).await {
                            error!(thing_id = %thing.id, "Failed to set up thing: {}", e);
                        }
                    })
                    .await;
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        registry.register_deleted_notifier(notifier(move |thing: Arc<Thing>| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let tasks = inner.tasks.clone();
                tasks
                    .track_future(async move {
                        if let Err(e) = inner.cleanup_thing(&thing).await {
                            error!(thing_id = %thing.id, "Failed to clean up thing: {}", e);
                        }
                    })
                    .await;
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        registry.register_updated_notifier(notifier(move |thing: Arc<Thing>| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let tasks = inner.tasks.clone();
                tasks
                    .track_future(async move {
                        // the previous definition is gone, so cleanup works
                        // from the updated one
                        if let Err(e) = inner.cleanup_thing(&thing).await {
                            error!(
                                thing_id = %thing.id,
                                "Failed to clean up updated thing: {}",
                                e
                            );
                        }
                        if let Err(e) = inner.setup_thing(thing.clone()).await {
                            error!(thing_id = %thing.id, "Failed to set up updated thing: {}", e);
                        }
                    })
                    .await;
            }
        }));
    }

    /// Publish a new value for a writable property.
    ///
    /// The set payload and set topic templates see the requested `value` and
    /// the `current` stored value (`null` if unknown).
    pub async fn set_item(
        &self,
        cancel: &CancellationToken,
        thing_id: &str,
        property_id: &str,
        value: Value,
    ) -> Result<()> {
        let registry = &self.inner.registry;
        let thing = registry.get(cancel, thing_id).await?;
        let property = thing.property(property_id).ok_or_else(|| {
            Error::NotFound(format!("property {} of thing {}", property_id, thing_id))
        })?;

        if property.readonly {
            return Err(Error::InvalidOptions(format!(
                "property {} of thing {} is read-only",
                property_id, thing_id
            )));
        }

        let current = match registry.get_item_value(cancel, thing_id, property_id).await {
            Ok(current) => current.unwrap_or(Value::Null),
            Err(e) => {
                debug!(
                    thing_id = %thing_id,
                    property_id = %property_id,
                    "Current value unavailable: {}",
                    e
                );
                Value::Null
            }
        };

        let bindings = [("value", value), ("current", current)];
        let payload_template = non_empty(&property.mqtt.set_payload, DEFAULT_SET_PAYLOAD);
        let topic_template = non_empty(&property.mqtt.set_topic, DEFAULT_SET_TOPIC);

        let payload = render_template(payload_template, &thing, Some(property), &bindings)?;
        let topic = render_template(topic_template, &thing, Some(property), &bindings)?;

        debug!(
            thing_id = %thing_id,
            property_id = %property_id,
            topic = %topic,
            "Publishing set request: {}",
            payload
        );

        // set requests are never retained
        self.inner
            .transport
            .publish(&topic, payload.into_bytes(), false)
            .await
    }
}

/// Parse on the blocking pool; script handlers may run for a while.
async fn parse_off_runtime(parser: &ResolvedHandler, payload: &[u8]) -> Result<Value> {
    let parser = parser.clone();
    let payload = payload.to_vec();
    tokio::task::spawn_blocking(move || parser.parse(&payload))
        .await
        .unwrap_or_else(|e| Err(Error::Handler(format!("parser task failed: {}", e))))
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

impl Inner {
    async fn setup_thing(self: &Arc<Self>, thing: Arc<Thing>) -> Result<()> {
        debug!(thing_id = %thing.id, "Setting up thing");

        let connection_topic = thing.connection_topic()?;
        let weak = Arc::downgrade(self);
        let thing_id = thing.id.clone();
        self.transport
            .subscribe(
                &connection_topic,
                message_handler(move |message| {
                    let weak = weak.clone();
                    let thing_id = thing_id.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_connection_update(&thing_id, message).await;
                        }
                    }
                }),
            )
            .await?;
        debug!(thing_id = %thing.id, topic = %connection_topic, "Subscribed to connection topic");

        for key in thing.properties.keys() {
            self.setup_status_listener(&thing, key).await?;
        }

        Ok(())
    }

    async fn setup_status_listener(self: &Arc<Self>, thing: &Arc<Thing>, key: &str) -> Result<()> {
        let topic = thing.status_topic(key)?;
        let spec = thing
            .property(key)
            .map(|p| p.status_handler())
            .ok_or_else(|| Error::NotFound(format!("property {} of thing {}", key, thing.id)))?;
        let parser = self.handlers.resolve(&spec)?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let thing_id = thing.id.clone();
        let property_id = key.to_string();
        self.transport
            .subscribe(
                &topic,
                message_handler(move |message| {
                    let weak = weak.clone();
                    let thing_id = thing_id.clone();
                    let property_id = property_id.clone();
                    let parser = parser.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner
                                .handle_status_report(&thing_id, &property_id, &parser, message)
                                .await;
                        }
                    }
                }),
            )
            .await?;

        debug!(
            thing_id = %thing.id,
            property_id = %key,
            topic = %topic,
            "Subscribed to status topic"
        );
        Ok(())
    }

    async fn cleanup_thing(&self, thing: &Thing) -> Result<()> {
        let mut topics = Vec::with_capacity(thing.properties.len() + 1);

        match thing.connection_topic() {
            Ok(topic) => topics.push(topic),
            Err(e) => {
                error!(thing_id = %thing.id, "Failed to render connection topic: {}", e);
            }
        }

        for key in thing.properties.keys() {
            match thing.status_topic(key) {
                Ok(topic) => topics.push(topic),
                Err(e) => {
                    error!(
                        thing_id = %thing.id,
                        property_id = %key,
                        "Failed to render status topic: {}",
                        e
                    );
                }
            }
        }

        debug!(thing_id = %thing.id, topics = topics.len(), "Cleaning up thing");
        self.transport.unsubscribe(&topics).await
    }

    async fn handle_status_report(
        &self,
        thing_id: &str,
        property_id: &str,
        parser: &ResolvedHandler,
        message: InboundMessage,
    ) {
        if message.duplicate {
            debug!(
                thing_id = %thing_id,
                property_id = %property_id,
                "Dropping duplicate status report"
            );
            self.ack(&message).await;
            return;
        }

        match parse_off_runtime(parser, &message.payload).await {
            Ok(value) => {
                info!(
                    thing_id = %thing_id,
                    property_id = %property_id,
                    "Status report: {}",
                    value
                );
                if let Err(e) = self.store_value(thing_id, property_id, value).await {
                    error!(
                        thing_id = %thing_id,
                        property_id = %property_id,
                        "Failed to store value: {}",
                        e
                    );
                }
            }
            Err(e) => {
                warn!(
                    thing_id = %thing_id,
                    property_id = %property_id,
                    handler = parser.handler_type(),
                    "Failed to parse status report: {}",
                    e
                );
            }
        }

        self.ack(&message).await;
    }

    async fn store_value(&self, thing_id: &str, property_id: &str, value: Value) -> Result<()> {
        // inbound messages are not tied to any caller's cancellation
        let cancel = CancellationToken::new();
        let store = self
            .registry
            .value_store(&cancel, thing_id, property_id)
            .await?;
        store.put(&cancel, value).await
    }

    async fn handle_connection_update(&self, thing_id: &str, message: InboundMessage) {
        if !message.duplicate {
            info!(
                thing_id = %thing_id,
                "Connection update: {}",
                String::from_utf8_lossy(&message.payload)
            );
        }
        self.ack(&message).await;
    }

    async fn ack(&self, message: &InboundMessage) {
        if let Err(e) = self.transport.ack(message).await {
            warn!(topic = %message.topic, "Failed to acknowledge message: {}", e);
        }
    }
}
