//! Thing and property descriptions.
//!
//! A [`Thing`] is a device or service exposing named [`Property`] values.
//! Definitions follow the WoT thing description layout plus an `mqtt` member
//! describing how each property maps onto the transport.
//!
//! ```yaml
//! id: lamp1
//! title: Desk lamp
//! properties:
//!   on:
//!     type: boolean
//!     mqtt:
//!       statusHandler:
//!         type: string
//! ```
//!
//! Call [`Thing::apply_defaults`] before [`Thing::validate`]; the registry
//! only ever stores things that went through both.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result, ValidationError};
use crate::payload::{HandlerRegistry, HandlerSpec};
use crate::template::TemplateContext;

/// Default connection status topic.
pub const DEFAULT_CONNECTED_TOPIC: &str = "{{.Thing.ID}}/connected";

/// Default topic a property reports its status on.
pub const DEFAULT_STATUS_TOPIC: &str = "{{.Thing.ID}}/status/{{.Item.ID}}";

/// Default topic set requests are published to.
pub const DEFAULT_SET_TOPIC: &str = "{{.Thing.ID}}/set/{{.Item.ID}}";

/// Default set request payload.
pub const DEFAULT_SET_PAYLOAD: &str = "{{.value}}";

/// Default status handler type.
pub const DEFAULT_STATUS_HANDLER: &str = "string";

/// Primitive property types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Null,
    Boolean,
    Object,
    Array,
    Number,
    Integer,
    String,
}

impl Primitive {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Primitive::Number | Primitive::Integer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Primitive::Null => "null",
            Primitive::Boolean => "boolean",
            Primitive::Object => "object",
            Primitive::Array => "array",
            Primitive::Number => "number",
            Primitive::Integer => "integer",
            Primitive::String => "string",
        }
    }
}

/// Transport settings of a single property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyTransport {
    /// Topic status reports are published on. Template.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_topic: String,

    /// Handler that turns status payloads into values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_handler: Option<HandlerSpec>,

    /// Topic set requests are published to. Template.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub set_topic: String,

    /// Payload of set requests. Template with `value` and `current` bound.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub set_payload: String,
}

/// Transport settings of a thing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingTransport {
    /// Topic the connection status is published on. Template.
    #[serde(rename = "connected", default, skip_serializing_if = "String::is_empty")]
    pub connected_topic: String,

    /// Defaults for the transport settings of every property.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_defaults: Option<PropertyTransport>,
}

/// A property of a thing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "@context", default, skip_serializing_if = "String::is_empty")]
    pub context_annotation: String,

    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub type_annotation: String,

    /// Copied from the property map key when defaults are applied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Primitive>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Allowed values.
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,

    #[serde(rename = "readOnly", default)]
    pub readonly: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(rename = "multipleOf", default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,

    #[serde(default)]
    pub mqtt: PropertyTransport,
}

impl Property {
    pub fn new(kind: Primitive) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Builder style setter for `readOnly`.
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Builder style setter for the status handler.
    pub fn with_status_handler(mut self, spec: HandlerSpec) -> Self {
        self.mqtt.status_handler = Some(spec);
        self
    }

    /// The status handler, falling back to `{"type": "string"}`.
    pub fn status_handler(&self) -> HandlerSpec {
        self.mqtt
            .status_handler
            .clone()
            .unwrap_or_else(|| HandlerSpec::new(DEFAULT_STATUS_HANDLER))
    }

    fn apply_defaults(&mut self, thing: &Thing) -> Result<()> {
        let defaults = thing.mqtt.property_defaults.as_ref();

        if !self.readonly {
            if self.mqtt.set_topic.is_empty() {
                self.mqtt.set_topic = render_template(DEFAULT_SET_TOPIC, thing, Some(&*self), &[])?;
            }
            if self.mqtt.set_payload.is_empty() {
                self.mqtt.set_payload = DEFAULT_SET_PAYLOAD.to_string();
            }
        }

        if self.mqtt.status_topic.is_empty() {
            let template = defaults
                .map(|d| d.status_topic.as_str())
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_STATUS_TOPIC);
            self.mqtt.status_topic = render_template(template, thing, Some(&*self), &[])?;
        }

        if self.mqtt.status_handler.is_none() {
            self.mqtt.status_handler = Some(
                defaults
                    .and_then(|d| d.status_handler.clone())
                    .unwrap_or_else(|| HandlerSpec::new(DEFAULT_STATUS_HANDLER)),
            );
        }

        Ok(())
    }

    /// Check the property stored under `key`. Every problem is reported.
    pub fn validate(&self, key: &str, handlers: &HandlerRegistry) -> ValidationError {
        let mut problems = ValidationError::new();

        if self.id.is_empty() {
            problems.add("property ID is missing");
        } else if self.id != key {
            problems.add(format!(
                "property ID '{}' does not match its key '{}'",
                self.id, key
            ));
        }

        if self.readonly && (!self.mqtt.set_topic.is_empty() || !self.mqtt.set_payload.is_empty()) {
            problems.add("property marked as readonly but set topic/payload configured");
        }

        let has_bounds =
            self.minimum.is_some() || self.maximum.is_some() || self.multiple_of.is_some();
        if has_bounds && !self.kind.map(|k| k.is_numeric()).unwrap_or(false) {
            problems.add(format!(
                "minimum, maximum and multipleOf require a number or integer type, got {}",
                self.kind.map(|k| k.as_str()).unwrap_or("no type")
            ));
        }

        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                problems.add(format!("minimum {} is greater than maximum {}", min, max));
            }
        }

        if let Some(multiple) = self.multiple_of {
            if multiple <= 0.0 {
                problems.add(format!("multipleOf must be positive, got {}", multiple));
            }
        }

        if let Some(spec) = &self.mqtt.status_handler {
            if let Err(e) = handlers.resolve(spec) {
                problems.add(format!("invalid payload handler: {}", e));
            }
        }

        problems
    }
}

/// A device or service and its properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    #[serde(rename = "@context", default, skip_serializing_if = "String::is_empty")]
    pub context_annotation: String,

    #[serde(rename = "@type", default, skip_serializing_if = "Vec::is_empty")]
    pub type_annotation: Vec<String>,

    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,

    #[serde(default)]
    pub mqtt: ThingTransport,
}

impl Thing {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Builder style helper adding a property under `id`.
    pub fn with_property(mut self, id: impl Into<String>, property: Property) -> Self {
        self.properties.insert(id.into(), property);
        self
    }

    pub fn property(&self, id: &str) -> Option<&Property> {
        self.properties.get(id)
    }

    /// Fill in every missing transport setting.
    ///
    /// Property IDs are copied from their map keys and default topics are
    /// rendered to concrete strings. Settings that are already present are
    /// left untouched, so applying defaults twice is harmless.
    pub fn apply_defaults(&mut self) -> Result<()> {
        if self.mqtt.connected_topic.is_empty() {
            self.mqtt.connected_topic = render_template(DEFAULT_CONNECTED_TOPIC, self, None, &[])?;
        }

        let keys: Vec<String> = self.properties.keys().cloned().collect();
        for key in keys {
            let Some(mut property) = self.properties.get(&key).cloned() else {
                continue;
            };
            property.id = key.clone();
            property.apply_defaults(self)?;
            self.properties.insert(key, property);
        }

        Ok(())
    }

    /// Validate the thing and all of its properties.
    ///
    /// Fails with [`Error::Validation`] carrying every problem found.
    pub fn validate(&self, handlers: &HandlerRegistry) -> Result<()> {
        let mut problems = ValidationError::new();

        if self.id.is_empty() {
            problems.add("thing ID is missing");
        }

        for (key, property) in &self.properties {
            problems.extend_scoped(&format!("property {}", key), property.validate(key, handlers));
        }

        problems.into_result()
    }

    /// Render the connection status topic.
    pub fn connection_topic(&self) -> Result<String> {
        let template = if self.mqtt.connected_topic.is_empty() {
            DEFAULT_CONNECTED_TOPIC
        } else {
            self.mqtt.connected_topic.as_str()
        };
        render_template(template, self, None, &[])
    }

    /// Render the status topic of the property stored under `key`.
    pub fn status_topic(&self, key: &str) -> Result<String> {
        let property = self
            .property(key)
            .ok_or_else(|| Error::NotFound(format!("property {} of thing {}", key, self.id)))?;
        let template = if property.mqtt.status_topic.is_empty() {
            DEFAULT_STATUS_TOPIC
        } else {
            property.mqtt.status_topic.as_str()
        };
        render_template(template, self, Some(property), &[])
    }
}

/// Render a topic or payload template for a thing.
///
/// The thing is bound as `Thing` and `thing`, the property (if any) as `Item`
/// and `item`. `extra` bindings are added last and win over the aliases.
pub fn render_template(
    template: &str,
    thing: &Thing,
    property: Option<&Property>,
    extra: &[(&str, Value)],
) -> Result<String> {
    let mut ctx = TemplateContext::new();

    let thing_value = serde_json::to_value(thing)?;
    ctx.bind("Thing", thing_value.clone());
    ctx.bind("thing", thing_value);

    if let Some(property) = property {
        let property_value = serde_json::to_value(property)?;
        ctx.bind("Item", property_value.clone());
        ctx.bind("item", property_value);
    }

    for (key, value) in extra {
        ctx.bind(*key, value.clone());
    }

    ctx.render(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lamp() -> Thing {
        Thing::new("lamp1")
            .with_property("power", Property::new(Primitive::Boolean))
            .with_property("temp", Property::new(Primitive::Number).read_only())
    }

    #[test]
    fn test_apply_defaults() {
        let mut thing = lamp();
        thing.apply_defaults().unwrap();

        assert_eq!(thing.mqtt.connected_topic, "lamp1/connected");

        let power = thing.property("power").unwrap();
        assert_eq!(power.id, "power");
        assert_eq!(power.mqtt.status_topic, "lamp1/status/power");
        assert_eq!(power.mqtt.set_topic, "lamp1/set/power");
        assert_eq!(power.mqtt.set_payload, DEFAULT_SET_PAYLOAD);
        assert_eq!(power.status_handler().handler_type().unwrap(), "string");

        let temp = thing.property("temp").unwrap();
        assert_eq!(temp.mqtt.status_topic, "lamp1/status/temp");
        assert!(temp.mqtt.set_topic.is_empty());
        assert!(temp.mqtt.set_payload.is_empty());

        let again = {
            let mut t = thing.clone();
            t.apply_defaults().unwrap();
            t
        };
        assert_eq!(again, thing);
    }

    #[test]
    fn test_property_defaults_from_thing() {
        let mut thing = lamp();
        thing.mqtt.property_defaults = Some(PropertyTransport {
            status_topic: "home/{{.thing.id}}/{{.item.id}}".to_string(),
            status_handler: Some(HandlerSpec::new("json").with("path", "$.val")),
            ..Default::default()
        });
        thing.apply_defaults().unwrap();

        let power = thing.property("power").unwrap();
        assert_eq!(power.mqtt.status_topic, "home/lamp1/power");
        assert_eq!(power.status_handler().handler_type().unwrap(), "json");
    }

    #[test]
    fn test_validate_aggregates_problems() {
        let handlers = HandlerRegistry::with_builtins();

        let mut bad = Property::new(Primitive::String).read_only();
        bad.minimum = Some(5.0);
        bad.maximum = Some(1.0);
        bad.multiple_of = Some(0.0);
        bad.mqtt.set_topic = "x/set".to_string();
        bad.mqtt.status_handler = Some(HandlerSpec::new("xml"));

        let mut thing = Thing::new("").with_property("bad", bad);
        thing.apply_defaults().unwrap();

        match thing.validate(&handlers) {
            Err(Error::Validation(report)) => {
                assert_eq!(report.len(), 6, "{}", report);
                assert_eq!(report.problems()[0], "thing ID is missing");
                assert!(report.problems()[1].starts_with("property bad: "));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_validate_key_mismatch() {
        let handlers = HandlerRegistry::with_builtins();
        let mut property = Property::new(Primitive::Integer);
        property.id = "other".to_string();
        let thing = Thing::new("t").with_property("count", property);

        let err = thing.validate(&handlers).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_valid_thing() {
        let handlers = HandlerRegistry::with_builtins();
        let mut thing = lamp();
        thing.apply_defaults().unwrap();
        thing.validate(&handlers).unwrap();
    }

    #[test]
    fn test_render_template_with_extras() {
        let mut thing = lamp();
        thing.apply_defaults().unwrap();
        let power = thing.property("power").unwrap();

        let rendered = render_template(
            "{{.Item.ID}}={{.value}} (was {{.current}})",
            &thing,
            Some(power),
            &[("value", json!(true)), ("current", Value::Null)],
        )
        .unwrap();
        assert_eq!(rendered, "power=true (was null)");

        assert!(render_template("{{.Item.ID}}", &thing, None, &[]).is_err());
    }

    #[test]
    fn test_serialized_member_names() {
        let raw = json!({
            "id": "sensor",
            "@type": ["TemperatureSensor"],
            "mqtt": {"connected": "sensor/online"},
            "properties": {
                "temp": {
                    "type": "number",
                    "readOnly": true,
                    "multipleOf": 0.5,
                    "enum": [1, 2],
                    "mqtt": {
                        "statusTopic": "sensor/temp",
                        "statusHandler": {"type": "json", "path": "$.val"}
                    }
                }
            }
        });

        let thing: Thing = serde_json::from_value(raw).unwrap();
        assert_eq!(thing.mqtt.connected_topic, "sensor/online");
        let temp = thing.property("temp").unwrap();
        assert!(temp.readonly);
        assert_eq!(temp.kind, Some(Primitive::Number));
        assert_eq!(temp.multiple_of, Some(0.5));
        assert_eq!(temp.allowed_values.len(), 2);
        assert_eq!(temp.mqtt.status_topic, "sensor/temp");

        let back = serde_json::to_value(&thing).unwrap();
        assert_eq!(back["properties"]["temp"]["readOnly"], json!(true));
        assert_eq!(back["mqtt"]["connected"], json!("sensor/online"));
    }
}
