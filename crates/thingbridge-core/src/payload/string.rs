//! `string` payload handler.
//!
//! Interprets the payload as UTF-8 text. Without a `regex` the whole payload
//! is returned. With a `regex`:
//!
//! - `group` and `index`: the `index`-th capture of the `group`-th match
//! - only `index`: the `index`-th whole match
//! - neither: the first match, or an empty string if nothing matches

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::{HandlerSpec, PayloadHandler, PayloadParser};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct StringConfig {
    regex: Option<String>,
    group: Option<i64>,
    index: Option<i64>,
}

/// Text extraction strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringHandler;

impl PayloadHandler for StringHandler {
    fn prepare(&self, spec: &HandlerSpec) -> Result<Box<dyn PayloadParser>> {
        let config: StringConfig = spec.config()?;

        let Some(pattern) = config.regex else {
            return Ok(Box::new(StringParser::Whole));
        };

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::Handler(format!("invalid regex '{}': {}", pattern, e)))?;

        let parser = match (config.group, config.index) {
            (Some(group), Some(index)) => StringParser::Capture {
                regex,
                group,
                index,
            },
            (None, Some(index)) => StringParser::NthMatch { regex, index },
            _ => StringParser::FirstMatch(regex),
        };

        Ok(Box::new(parser))
    }
}

#[derive(Debug)]
enum StringParser {
    Whole,
    FirstMatch(Regex),
    NthMatch { regex: Regex, index: i64 },
    Capture { regex: Regex, group: i64, index: i64 },
}

impl PayloadParser for StringParser {
    fn parse(&self, payload: &[u8]) -> Result<Value> {
        let text = String::from_utf8_lossy(payload);

        let extracted = match self {
            StringParser::Whole => text.into_owned(),
            StringParser::FirstMatch(regex) => regex
                .find(&text)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            StringParser::NthMatch { regex, index } => {
                let m = usize::try_from(*index)
                    .ok()
                    .and_then(|i| regex.find_iter(&text).nth(i))
                    .ok_or_else(|| Error::Handler("index out of bounds".to_string()))?;
                m.as_str().to_string()
            }
            StringParser::Capture {
                regex,
                group,
                index,
            } => {
                let captures = usize::try_from(*group)
                    .ok()
                    .and_then(|g| regex.captures_iter(&text).nth(g))
                    .ok_or_else(|| Error::Handler("capture group out of bounds".to_string()))?;

                let slot = usize::try_from(*index)
                    .ok()
                    .filter(|i| *i < captures.len())
                    .ok_or_else(|| Error::Handler("index out of bounds".to_string()))?;

                // unmatched optional groups extract as empty text
                captures
                    .get(slot)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            }
        };

        Ok(Value::String(extracted))
    }
}
