//! Mission control against the loopback transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thingbridge_core::{
    CancellationToken, Error, HandlerRegistry, HandlerSpec, Primitive, Property, Thing,
};
use thingbridge_devices::{InboundMessage, LoopbackTransport, MissionControl, Registry};
use thingbridge_storage::DriverRegistry;

struct Harness {
    transport: Arc<LoopbackTransport>,
    registry: Arc<Registry>,
    mission: MissionControl,
    cancel: CancellationToken,
}

async fn harness() -> Harness {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(Registry::open(&DriverRegistry::with_builtins(), "memory", "").unwrap());
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let mission = MissionControl::new(transport.clone(), registry.clone(), handlers);
    let cancel = CancellationToken::new();
    mission.start(&cancel).await.unwrap();

    Harness {
        transport,
        registry,
        mission,
        cancel,
    }
}

fn lamp() -> Thing {
    let mut thing = Thing::new("lamp1").with_property("on", Property::new(Primitive::Boolean));
    thing.apply_defaults().unwrap();
    thing
}

fn sensor() -> Thing {
    let mut thing = Thing::new("sensor1").with_property(
        "temp",
        Property::new(Primitive::Number)
            .read_only()
            .with_status_handler(HandlerSpec::new("json").with("path", "$.temp")),
    );
    thing.apply_defaults().unwrap();
    thing
}

async fn stored(h: &Harness, thing_id: &str, property_id: &str) -> Option<Value> {
    h.registry
        .get_item_value(&h.cancel, thing_id, property_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_created_thing_is_subscribed_and_reports_are_stored() {
    let h = harness().await;

    h.registry.create(&h.cancel, lamp()).await.unwrap();
    h.registry.drain().await;

    let subscriptions = h.transport.subscriptions();
    assert!(subscriptions.contains(&"lamp1/connected".to_string()));
    assert!(subscriptions.contains(&"lamp1/status/on".to_string()));

    assert_eq!(h.transport.inject("lamp1/status/on", "ON").await, 1);
    assert_eq!(stored(&h, "lamp1", "on").await, Some(json!("ON")));
    assert_eq!(h.transport.ack_count(), 1);
}

#[tokio::test]
async fn test_existing_things_are_set_up_on_start() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(Registry::open(&DriverRegistry::with_builtins(), "memory", "").unwrap());
    let cancel = CancellationToken::new();
    registry.create(&cancel, sensor()).await.unwrap();

    let mission = MissionControl::new(
        transport.clone(),
        registry.clone(),
        Arc::new(HandlerRegistry::with_builtins()),
    );
    mission.start(&cancel).await.unwrap();

    transport
        .inject("sensor1/status/temp", r#"{"temp": 21.5}"#)
        .await;
    assert_eq!(
        registry.get_item_value(&cancel, "sensor1", "temp").await.unwrap(),
        Some(json!(21.5))
    );
}

#[tokio::test]
async fn test_deleted_thing_is_unsubscribed_in_one_batch() {
    let h = harness().await;

    h.registry.create(&h.cancel, lamp()).await.unwrap();
    h.registry.drain().await;
    h.registry.delete(&h.cancel, "lamp1").await.unwrap();
    h.registry.drain().await;

    let calls = h.transport.unsubscribe_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        vec!["lamp1/connected".to_string(), "lamp1/status/on".to_string()]
    );
    assert!(h.transport.subscriptions().is_empty());
    assert_eq!(h.transport.inject("lamp1/status/on", "ON").await, 0);
}

#[tokio::test]
async fn test_updated_thing_is_resubscribed() {
    let h = harness().await;

    h.registry.create(&h.cancel, lamp()).await.unwrap();
    h.registry.drain().await;

    let mut updated = Thing::new("lamp1")
        .with_property("on", Property::new(Primitive::Boolean))
        .with_property("brightness", Property::new(Primitive::Integer));
    updated.apply_defaults().unwrap();
    h.registry.update(&h.cancel, updated).await.unwrap();
    h.registry.drain().await;

    let subscriptions = h.transport.subscriptions();
    assert!(subscriptions.contains(&"lamp1/status/on".to_string()));
    assert!(subscriptions.contains(&"lamp1/status/brightness".to_string()));
    assert_eq!(h.transport.unsubscribe_calls().len(), 1);
}

#[tokio::test]
async fn test_duplicate_report_is_acked_but_not_stored() {
    let h = harness().await;
    h.registry.create(&h.cancel, lamp()).await.unwrap();
    h.registry.drain().await;

    let message = InboundMessage::new("lamp1/status/on", "ON")
        .with_delivery(7, 1)
        .with_duplicate(true);
    h.transport.deliver(message.clone()).await;

    assert!(message.is_acked());
    assert_eq!(h.transport.ack_count(), 1);
    assert_eq!(stored(&h, "lamp1", "on").await, None);
}

#[tokio::test]
async fn test_unparsable_report_is_acked_but_not_stored() {
    let h = harness().await;
    h.registry.create(&h.cancel, sensor()).await.unwrap();
    h.registry.drain().await;

    h.transport.inject("sensor1/status/temp", "not json").await;
    h.transport.inject("sensor1/status/temp", r#"{"humidity": 40}"#).await;

    assert_eq!(h.transport.ack_count(), 2);
    assert_eq!(stored(&h, "sensor1", "temp").await, None);
}

#[tokio::test]
async fn test_runaway_script_report_is_acked_but_not_stored() {
    let h = harness().await;
    let mut thing = Thing::new("pump1").with_property(
        "state",
        Property::new(Primitive::String)
            .read_only()
            .with_status_handler(HandlerSpec::new("script").with("code", "while (true) {}")),
    );
    thing.apply_defaults().unwrap();
    h.registry.create(&h.cancel, thing).await.unwrap();
    h.registry.drain().await;

    let delivered = tokio::time::timeout(
        Duration::from_secs(30),
        h.transport.inject("pump1/status/state", "ON"),
    )
    .await
    .expect("script evaluation was not stopped");

    assert_eq!(delivered, 1);
    assert_eq!(h.transport.ack_count(), 1);
    assert_eq!(stored(&h, "pump1", "state").await, None);
}

#[tokio::test]
async fn test_connection_update_is_acked() {
    let h = harness().await;
    h.registry.create(&h.cancel, lamp()).await.unwrap();
    h.registry.drain().await;

    assert_eq!(h.transport.inject("lamp1/connected", "2").await, 1);
    assert_eq!(h.transport.ack_count(), 1);
}

#[tokio::test]
async fn test_set_item_publishes_without_retain() {
    let h = harness().await;
    h.registry.create(&h.cancel, lamp()).await.unwrap();

    h.mission
        .set_item(&h.cancel, "lamp1", "on", json!(true))
        .await
        .unwrap();

    let published = h.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "lamp1/set/on");
    assert_eq!(published[0].payload_str(), "true");
    assert!(!published[0].retain);
}

#[tokio::test]
async fn test_set_item_templates_see_current_value() {
    let h = harness().await;

    let mut property = Property::new(Primitive::Integer);
    property.mqtt.set_payload = "{{.current}}->{{.value}}".to_string();
    let mut thing = Thing::new("dimmer").with_property("level", property);
    thing.apply_defaults().unwrap();
    h.registry.create(&h.cancel, thing).await.unwrap();

    h.mission
        .set_item(&h.cancel, "dimmer", "level", json!(40))
        .await
        .unwrap();

    let store = h
        .registry
        .value_store(&h.cancel, "dimmer", "level")
        .await
        .unwrap();
    store.put(&h.cancel, json!(40)).await.unwrap();

    h.mission
        .set_item(&h.cancel, "dimmer", "level", json!(80))
        .await
        .unwrap();

    let payloads: Vec<String> = h
        .transport
        .published()
        .iter()
        .map(|m| m.payload_str())
        .collect();
    assert_eq!(payloads, vec!["null->40".to_string(), "40->80".to_string()]);
}

#[tokio::test]
async fn test_set_item_errors() {
    let h = harness().await;
    h.registry.create(&h.cancel, sensor()).await.unwrap();

    let err = h
        .mission
        .set_item(&h.cancel, "ghost", "on", json!(true))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = h
        .mission
        .set_item(&h.cancel, "sensor1", "humidity", json!(1))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = h
        .mission
        .set_item(&h.cancel, "sensor1", "temp", json!(20))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
    assert!(h.transport.published().is_empty());
}

#[tokio::test]
async fn test_set_item_surfaces_publish_failure() {
    let h = harness().await;
    h.registry.create(&h.cancel, lamp()).await.unwrap();
    h.transport.fail_publishes(true);

    let err = h
        .mission
        .set_item(&h.cancel, "lamp1", "on", json!(false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}

#[tokio::test]
async fn test_run_returns_after_shutdown() {
    let transport = Arc::new(LoopbackTransport::new());
    let registry = Arc::new(Registry::open(&DriverRegistry::with_builtins(), "memory", "").unwrap());
    let mission = MissionControl::new(
        transport,
        registry,
        Arc::new(HandlerRegistry::with_builtins()),
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let mission = mission.clone();
        let shutdown = shutdown.clone();
        async move { mission.run(shutdown).await }
    });

    // let startup finish before shutting down
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
