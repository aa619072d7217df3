//! Payload dispatch through thing definitions.

use serde_json::json;
use thingbridge_core::{Error, HandlerRegistry, HandlerSpec, Primitive, Property, Thing};

fn thermometer() -> Thing {
    let mut thing = Thing::new("thermo").with_property(
        "temp",
        Property::new(Primitive::Number)
            .read_only()
            .with_status_handler(HandlerSpec::new("json").with("path", "$.temperature")),
    );
    thing.apply_defaults().unwrap();
    thing
}

#[test]
fn test_resolve_once_parse_many() {
    let handlers = HandlerRegistry::with_builtins();
    let thing = thermometer();
    thing.validate(&handlers).unwrap();

    let spec = thing.property("temp").unwrap().status_handler();
    let resolved = handlers.resolve(&spec).unwrap();
    assert_eq!(resolved.handler_type(), "json");

    for (payload, expected) in [
        (r#"{"temperature": 20}"#, json!(20)),
        (r#"{"temperature": -4.5, "unit": "C"}"#, json!(-4.5)),
    ] {
        assert_eq!(resolved.parse(payload.as_bytes()).unwrap(), expected);
    }

    assert!(resolved.parse(br#"{"humidity": 40}"#).is_err());
}

#[test]
fn test_group_index_bounds_fail_at_handler_level() {
    let handlers = HandlerRegistry::with_builtins();
    let spec: HandlerSpec = serde_json::from_value(json!({
        "type": "string",
        "regex": "\\d",
        "group": 0,
        "index": 2
    }))
    .unwrap();

    match handlers.parse(&spec, b"foo 1 bar") {
        Err(Error::Handler(msg)) => assert_eq!(msg, "index out of bounds"),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn test_unknown_handler_fails_validation() {
    let handlers = HandlerRegistry::with_builtins();
    let mut thing = Thing::new("thermo").with_property(
        "temp",
        Property::new(Primitive::Number).with_status_handler(HandlerSpec::new("lua")),
    );
    thing.apply_defaults().unwrap();

    let err = thing.validate(&handlers).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("invalid payload handler"));
}

#[test]
fn test_definition_with_extended_json_handler() {
    let handlers = HandlerRegistry::with_builtins();
    let mut thing: Thing = serde_json::from_value(json!({
        "id": "switch",
        "properties": {
            "on": {
                "type": "boolean",
                "mqtt": {
                    "statusHandler": {"type": "json-extended"}
                }
            }
        }
    }))
    .unwrap();
    thing.apply_defaults().unwrap();
    thing.validate(&handlers).unwrap();

    let spec = thing.property("on").unwrap().status_handler();
    assert_eq!(handlers.parse(&spec, br#"{"val": true}"#).unwrap(), json!(true));
}
