//! `script` payload handler.
//!
//! Evaluates JavaScript with the Boa engine. The payload is bound to the
//! global `value`, either as a string or, with `content: json`, as the decoded
//! document. Configuration:
//!
//! ```yaml
//! statusHandler:
//!   type: script
//!   content: json
//!   return: value.state == "ON"
//! ```
//!
//! `return` is a single expression; `code` is a script whose completion value
//! becomes the result. Each payload is evaluated in a fresh context with loop
//! iteration and recursion limits; a script that exceeds them fails.

use boa_engine::{Context, JsValue, Source};
use serde::Deserialize;
use serde_json::{Number, Value};

use super::{HandlerSpec, PayloadHandler, PayloadParser};
use crate::error::{Error, Result};

/// Iterations allowed per loop before evaluation is aborted.
pub const LOOP_ITERATION_LIMIT: u64 = 100_000;

/// Maximum call depth.
pub const RECURSION_LIMIT: usize = 256;

#[derive(Debug, Deserialize)]
struct ScriptConfig {
    #[serde(rename = "return")]
    expression: Option<String>,
    code: Option<String>,
    content: Option<String>,
}

/// JavaScript evaluation strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptHandler;

impl PayloadHandler for ScriptHandler {
    fn prepare(&self, spec: &HandlerSpec) -> Result<Box<dyn PayloadParser>> {
        let config: ScriptConfig = spec.config()?;

        let body = match (config.expression, config.code) {
            (Some(expression), _) => format!("(\n{}\n)", expression),
            (None, Some(code)) => code,
            (None, None) => {
                return Err(Error::Handler("no converter code specified".to_string()));
            }
        };

        let content = match config.content.as_deref() {
            None | Some("") => Content::Text,
            Some("json") => Content::Json,
            Some(other) => {
                return Err(Error::Handler(format!("invalid content type '{}'", other)));
            }
        };

        Ok(Box::new(ScriptParser { body, content }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Content {
    Text,
    Json,
}

#[derive(Debug)]
struct ScriptParser {
    body: String,
    content: Content,
}

impl ScriptParser {
    fn binding(&self, payload: &[u8]) -> Result<Value> {
        match self.content {
            Content::Text => Ok(Value::String(String::from_utf8_lossy(payload).into_owned())),
            Content::Json => serde_json::from_slice(payload)
                .map_err(|e| Error::Handler(format!("payload is not valid JSON: {}", e))),
        }
    }
}

impl PayloadParser for ScriptParser {
    fn parse(&self, payload: &[u8]) -> Result<Value> {
        // JSON text is a valid JavaScript literal
        let source = format!("const value = {};\n{}", self.binding(payload)?, self.body);

        let mut context = Context::default();
        let limits = context.runtime_limits_mut();
        limits.set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
        limits.set_recursion_limit(RECURSION_LIMIT);

        let result = context
            .eval(Source::from_bytes(&source))
            .map_err(|e| Error::Handler(format!("script failed: {}", e)))?;

        match &result {
            JsValue::Boolean(b) => Ok(Value::Bool(*b)),
            JsValue::String(s) => Ok(Value::String(s.to_std_string_escaped())),
            JsValue::Integer(i) => Ok(Value::from(*i)),
            JsValue::Rational(f) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| Error::InvalidResult(format!("non-finite number {}", f))),
            JsValue::Object(_) => result
                .to_json(&mut context)
                .map_err(|e| Error::InvalidResult(format!("object not convertible: {}", e))),
            JsValue::Null => Err(Error::InvalidResult("null".to_string())),
            JsValue::Undefined => Err(Error::InvalidResult("undefined".to_string())),
            JsValue::BigInt(_) => Err(Error::InvalidResult("bigint".to_string())),
            JsValue::Symbol(_) => Err(Error::InvalidResult("symbol".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> HandlerSpec {
        HandlerSpec::new("script")
    }

    #[test]
    fn test_return_expression_on_text() {
        let spec = spec().with("return", "value == \"ON\"");
        assert_eq!(ScriptHandler.parse(b"ON", &spec).unwrap(), json!(true));
        assert_eq!(ScriptHandler.parse(b"OFF", &spec).unwrap(), json!(false));
    }

    #[test]
    fn test_json_content() {
        let spec = spec().with("content", "json").with("return", "value.temp + 0.25");
        assert_eq!(ScriptHandler.parse(br#"{"temp": 10.5}"#, &spec).unwrap(), json!(10.75));

        let spec = self::spec()
            .with("content", "json")
            .with("return", "{ on: value.state === 'ON', level: value.level }");
        let value = ScriptHandler.parse(br#"{"state": "ON", "level": 3}"#, &spec).unwrap();
        assert_eq!(value["on"], json!(true));
        assert_eq!(value["level"].as_f64(), Some(3.0));
    }

    #[test]
    fn test_code_completion_value() {
        let spec = spec().with("code", "let parts = value.split(';');\nparts[1].trim();");
        assert_eq!(ScriptHandler.parse(b"a; b ;c", &spec).unwrap(), json!("b"));
    }

    #[test]
    fn test_invalid_results() {
        for expression in ["undefined", "null", "1 / 0", "Symbol('x')"] {
            let err = ScriptHandler
                .parse(b"x", &spec().with("return", expression))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidResult(_)), "{} -> {:?}", expression, err);
        }
    }

    #[test]
    fn test_runaway_scripts_are_stopped() {
        let err = ScriptHandler
            .parse(b"x", &spec().with("code", "while (true) {}"))
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)), "{:?}", err);

        let err = ScriptHandler
            .parse(
                b"x",
                &spec().with("code", "function f(n) { return f(n + 1); }\nf(0);"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)), "{:?}", err);

        // bounded loops below the limit still run
        let spec = spec().with("code", "let n = 0;\nfor (let i = 0; i < 1000; i++) { n += i; }\nn;");
        let value = ScriptHandler.parse(b"x", &spec).unwrap();
        assert_eq!(value.as_f64(), Some(499500.0));
    }

    #[test]
    fn test_configuration_errors() {
        assert!(ScriptHandler.prepare(&spec()).is_err());
        assert!(ScriptHandler
            .prepare(&spec().with("return", "1").with("content", "xml"))
            .is_err());
        assert!(ScriptHandler.parse(b"x", &spec().with("return", "value.")).is_err());
        assert!(ScriptHandler
            .parse(b"not json", &spec().with("return", "1").with("content", "json"))
            .is_err());
    }
}
