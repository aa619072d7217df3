//! Payload handler dispatch.
//!
//! Status reports arrive as raw bytes. Each property carries a
//! [`HandlerSpec`], a `type`-tagged configuration map that selects one of the
//! strategies registered in a [`HandlerRegistry`] and parameterizes it.
//!
//! Strategies work in two steps: [`PayloadHandler::prepare`] turns the loose
//! spec into a strongly typed [`PayloadParser`] (compiling regular
//! expressions, parsing paths, ...), and the parser is then applied to every
//! payload. [`HandlerRegistry::resolve`] performs the first step once, when a
//! thing is set up, so nothing is re-interpreted per message.
//!
//! ## Built-in types
//!
//! | Type | Module | Description |
//! |------|--------|-------------|
//! | `string` | [`string`] | Payload as text, optional regex extraction |
//! | `json` | [`json`] | Path extraction from a JSON document |
//! | `json-extended` | [`json`] | `json` with the fixed path `$.val` |
//! | `script` | `script` | JavaScript expression or script (feature `script`) |

pub mod json;
#[cfg(feature = "script")]
pub mod script;
pub mod string;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Key of the handler type inside a [`HandlerSpec`].
pub const TYPE_KEY: &str = "type";

/// Declarative payload handler selection and configuration.
///
/// Must contain a `type` key naming a registered handler. All other keys are
/// handler specific.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerSpec(Map<String, Value>);

impl HandlerSpec {
    /// Create a spec for the given handler type without further configuration.
    pub fn new(handler_type: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(TYPE_KEY.to_string(), Value::String(handler_type.into()));
        Self(map)
    }

    /// Builder style setter for a configuration key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The handler type named by this spec.
    pub fn handler_type(&self) -> Result<&str> {
        match self.0.get(TYPE_KEY) {
            None => Err(Error::NoType),
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(Error::InvalidType(format!(
                "handler type must be a string, got {}",
                other
            ))),
        }
    }

    /// Raw access to a configuration key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Deserialize the spec into a handler specific configuration struct.
    ///
    /// Unknown keys (including `type`) are ignored by the target struct.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| {
            Error::Handler(format!(
                "invalid {} handler configuration: {}",
                self.handler_type().unwrap_or("<unknown>"),
                e
            ))
        })
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for HandlerSpec {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A prepared, strongly typed parser produced by a [`PayloadHandler`].
pub trait PayloadParser: Send + Sync {
    /// Extract a value from the raw payload.
    fn parse(&self, payload: &[u8]) -> Result<Value>;
}

/// A payload parsing strategy.
pub trait PayloadHandler: Send + Sync {
    /// Validate `spec` and build a parser for it.
    fn prepare(&self, spec: &HandlerSpec) -> Result<Box<dyn PayloadParser>>;

    /// Parse a single payload with the given spec.
    fn parse(&self, payload: &[u8], spec: &HandlerSpec) -> Result<Value> {
        self.prepare(spec)?.parse(payload)
    }
}

/// A spec resolved against a [`HandlerRegistry`] and ready to parse payloads.
#[derive(Clone)]
pub struct ResolvedHandler {
    handler_type: String,
    parser: Arc<dyn PayloadParser>,
}

impl ResolvedHandler {
    pub fn handler_type(&self) -> &str {
        &self.handler_type
    }

    /// Parse a payload.
    ///
    /// A panic inside the strategy is caught here and returned as
    /// [`Error::Handler`], so a misbehaving handler cannot take down the
    /// task that dispatches inbound messages.
    pub fn parse(&self, payload: &[u8]) -> Result<Value> {
        let parser = &self.parser;
        match panic::catch_unwind(AssertUnwindSafe(|| parser.parse(payload))) {
            Ok(result) => result,
            Err(cause) => Err(Error::Handler(format!(
                "{} handler panicked: {}",
                self.handler_type,
                panic_message(cause.as_ref())
            ))),
        }
    }
}

impl fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("handler_type", &self.handler_type)
            .finish_non_exhaustive()
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Maps handler type names to strategies.
///
/// Populated once at process start and read-only afterwards, hence a plain
/// reader/writer lock.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn PayloadHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in handler type registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.must_register_type("string", string::StringHandler);
        registry.must_register_type("json", json::JsonHandler::new());
        registry.must_register_type("json-extended", json::JsonHandler::extended());
        #[cfg(feature = "script")]
        registry.must_register_type("script", script::ScriptHandler);
        registry
    }

    /// Register a handler type. Names must be unique.
    pub fn register_type<H>(&self, name: impl Into<String>, handler: H) -> Result<()>
    where
        H: PayloadHandler + 'static,
    {
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        if handlers.contains_key(&name) {
            return Err(Error::AlreadyRegistered(format!("handler type '{}'", name)));
        }

        tracing::debug!(handler_type = %name, "Registered payload handler");
        handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Register a handler type and panic if the name is taken.
    ///
    /// Only meant for process initialization.
    pub fn must_register_type<H>(&self, name: impl Into<String>, handler: H)
    where
        H: PayloadHandler + 'static,
    {
        if let Err(e) = self.register_type(name, handler) {
            panic!("failed to register payload handler: {}", e);
        }
    }

    /// Whether `name` is a registered handler type.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// All registered handler type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Look up the strategy selected by `spec`.
    pub fn handler(&self, spec: &HandlerSpec) -> Result<Arc<dyn PayloadHandler>> {
        let name = spec.handler_type()?;
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidType(format!("unknown handler type '{}'", name)))
    }

    /// Resolve `spec` into a prepared parser.
    pub fn resolve(&self, spec: &HandlerSpec) -> Result<ResolvedHandler> {
        let handler = self.handler(spec)?;
        let handler_type = spec.handler_type()?.to_string();

        let prepared = panic::catch_unwind(AssertUnwindSafe(|| handler.prepare(spec)))
            .unwrap_or_else(|cause| {
                Err(Error::Handler(format!(
                    "{} handler panicked: {}",
                    handler_type,
                    panic_message(cause.as_ref())
                )))
            })?;

        Ok(ResolvedHandler {
            handler_type,
            parser: Arc::from(prepared),
        })
    }

    /// Resolve `spec` and parse a single payload with it.
    pub fn parse(&self, spec: &HandlerSpec, payload: &[u8]) -> Result<Value> {
        self.resolve(spec)?.parse(payload)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Exploding;

    struct ExplodingParser;

    impl PayloadParser for ExplodingParser {
        fn parse(&self, _payload: &[u8]) -> Result<Value> {
            panic!("boom");
        }
    }

    impl PayloadHandler for Exploding {
        fn prepare(&self, _spec: &HandlerSpec) -> Result<Box<dyn PayloadParser>> {
            Ok(Box::new(ExplodingParser))
        }
    }

    struct Constant(Value);

    struct ConstantParser(Value);

    impl PayloadParser for ConstantParser {
        fn parse(&self, _payload: &[u8]) -> Result<Value> {
            Ok(self.0.clone())
        }
    }

    impl PayloadHandler for Constant {
        fn prepare(&self, _spec: &HandlerSpec) -> Result<Box<dyn PayloadParser>> {
            Ok(Box::new(ConstantParser(self.0.clone())))
        }
    }

    #[test]
    fn test_missing_type() {
        let registry = HandlerRegistry::with_builtins();
        let spec = HandlerSpec::default().with("regex", "\\d");
        assert!(matches!(registry.parse(&spec, b"1"), Err(Error::NoType)));
    }

    #[test]
    fn test_non_string_or_unknown_type() {
        let registry = HandlerRegistry::with_builtins();

        let spec = HandlerSpec::default().with("type", 42);
        assert!(matches!(registry.parse(&spec, b"1"), Err(Error::InvalidType(_))));

        let spec = HandlerSpec::new("xml");
        assert!(matches!(registry.parse(&spec, b"1"), Err(Error::InvalidType(_))));
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let registry = HandlerRegistry::new();
        registry.register_type("fixed", Constant(json!(1))).unwrap();

        let err = registry.register_type("fixed", Constant(json!(2))).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));

        let value = registry.parse(&HandlerSpec::new("fixed"), b"ignored").unwrap();
        assert_eq!(value, json!(1));
    }

    #[test]
    #[should_panic(expected = "failed to register payload handler")]
    fn test_must_register_panics_on_duplicate() {
        let registry = HandlerRegistry::with_builtins();
        registry.must_register_type("string", string::StringHandler);
    }

    #[test]
    fn test_panicking_handler_becomes_error() {
        let registry = HandlerRegistry::new();
        registry.register_type("exploding", Exploding).unwrap();

        let err = registry.parse(&HandlerSpec::new("exploding"), b"x").unwrap_err();
        match err {
            Error::Handler(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_builtin_types() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.contains("string"));
        assert!(registry.contains("json"));
        assert!(registry.contains("json-extended"));
        #[cfg(feature = "script")]
        assert!(registry.contains("script"));
    }

    #[test]
    fn test_spec_round_trips_through_serde() {
        let spec: HandlerSpec =
            serde_json::from_value(json!({"type": "json", "path": "$.temp"})).unwrap();
        assert_eq!(spec.handler_type().unwrap(), "json");
        assert_eq!(spec.get("path"), Some(&json!("$.temp")));
    }
}
