//! `json` and `json-extended` payload handlers.
//!
//! The payload is decoded as JSON and a path is evaluated against it.
//! Supported path syntax:
//!
//! - `$` - the document root
//! - `.key` - object member
//! - `['key']` / `["key"]` - object member, any characters
//! - `[n]` - array element, negative counts from the end
//! - `*` / `[*]` - every member or element
//! - `[start:end]` - array slice
//! - `[a,b]` - union of subscripts
//! - `..name` - `name` at any depth
//!
//! A path of only member and element steps yields the value itself, others
//! an array of every match.
//!
//! `json-extended` uses the fixed path `$.val` and rejects a `path` key.

use serde::Deserialize;
use serde_json::Value;

use super::{HandlerSpec, PayloadHandler, PayloadParser};
use crate::error::{Error, Result};

const ROOT: &str = "$";
const EXTENDED_PATH: &str = "$.val";

#[derive(Debug, Deserialize)]
struct JsonConfig {
    path: Option<String>,
}

/// JSON path extraction strategy.
#[derive(Debug, Clone, Default)]
pub struct JsonHandler {
    fixed_path: Option<&'static str>,
}

impl JsonHandler {
    /// The `json` handler: path taken from the spec, `$` by default.
    pub fn new() -> Self {
        Self { fixed_path: None }
    }

    /// The `json-extended` handler.
    pub fn extended() -> Self {
        Self {
            fixed_path: Some(EXTENDED_PATH),
        }
    }
}

impl PayloadHandler for JsonHandler {
    fn prepare(&self, spec: &HandlerSpec) -> Result<Box<dyn PayloadParser>> {
        let path = match self.fixed_path {
            Some(fixed) => {
                if spec.contains_key("path") {
                    return Err(Error::Handler("`path` argument not supported".to_string()));
                }
                fixed.to_string()
            }
            None => {
                let config: JsonConfig = spec.config()?;
                config.path.unwrap_or_else(|| ROOT.to_string())
            }
        };

        let segments = parse_path(&path)?;
        Ok(Box::new(JsonParser { path, segments }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    /// Negative indices count from the end.
    Index(i64),
    Wildcard,
    Slice {
        start: Option<i64>,
        end: Option<i64>,
    },
    Union(Vec<Segment>),
    /// `..`: the inner segment applied at every depth.
    Descendants(Box<Segment>),
}

impl Segment {
    /// Selects at most one value.
    fn is_definite(&self) -> bool {
        matches!(self, Segment::Key(_) | Segment::Index(_))
    }

    fn select<'a>(&self, value: &'a Value, out: &mut Vec<&'a Value>) {
        match (self, value) {
            (Segment::Key(key), Value::Object(map)) => out.extend(map.get(key)),
            (Segment::Index(i), Value::Array(items)) => {
                out.extend(resolve_index(*i, items.len()).and_then(|i| items.get(i)))
            }
            (Segment::Wildcard, Value::Object(map)) => out.extend(map.values()),
            (Segment::Wildcard, Value::Array(items)) => out.extend(items.iter()),
            (Segment::Slice { start, end }, Value::Array(items)) => {
                let len = items.len();
                let from = start.map_or(0, |s| clamp_index(s, len));
                let to = end.map_or(len, |e| clamp_index(e, len));
                if from < to {
                    out.extend(items[from..to].iter());
                }
            }
            (Segment::Union(members), _) => {
                for member in members {
                    member.select(value, out);
                }
            }
            (Segment::Descendants(inner), _) => inner.select_recursive(value, out),
            _ => {}
        }
    }

    fn select_recursive<'a>(&self, value: &'a Value, out: &mut Vec<&'a Value>) {
        self.select(value, out);
        match value {
            Value::Object(map) => map.values().for_each(|v| self.select_recursive(v, out)),
            Value::Array(items) => items.iter().for_each(|v| self.select_recursive(v, out)),
            _ => {}
        }
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        usize::try_from(index).ok()
    } else {
        len.checked_sub(usize::try_from(index.unsigned_abs()).ok()?)
    }
}

fn clamp_index(index: i64, len: usize) -> usize {
    resolve_index(index, len).map_or(0, |i| i.min(len))
}

#[derive(Debug)]
struct JsonParser {
    path: String,
    segments: Vec<Segment>,
}

impl PayloadParser for JsonParser {
    /// A path made of member and index steps yields the value itself; any
    /// wildcard, slice, union or `..` step yields an array of all matches.
    fn parse(&self, payload: &[u8]) -> Result<Value> {
        let document: Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Handler(format!("payload is not valid JSON: {}", e)))?;

        let mut current = vec![&document];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                segment.select(value, &mut next);
            }
            current = next;
        }

        if self.segments.iter().all(Segment::is_definite) {
            return current
                .first()
                .map(|v| (*v).clone())
                .ok_or_else(|| Error::Handler(format!("path {} not found in payload", self.path)));
        }

        if current.is_empty() {
            return Err(Error::Handler(format!("path {} matched nothing", self.path)));
        }
        Ok(Value::Array(current.into_iter().cloned().collect()))
    }
}

fn parse_path(path: &str) -> Result<Vec<Segment>> {
    let invalid = |reason: &str| Error::Handler(format!("invalid path '{}': {}", path, reason));

    let rest = path
        .trim()
        .strip_prefix(ROOT)
        .ok_or_else(|| invalid("must start with '$'"))?;

    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        match chars[pos] {
            '.' if chars.get(pos + 1) == Some(&'.') => {
                pos += 2;
                let inner = match chars.get(pos) {
                    Some('[') => {
                        let (segment, next) = parse_bracket(&chars, pos).map_err(|r| invalid(&r))?;
                        pos = next;
                        segment
                    }
                    _ => {
                        let (segment, next) = parse_member(&chars, pos).map_err(|r| invalid(&r))?;
                        pos = next;
                        segment
                    }
                };
                segments.push(Segment::Descendants(Box::new(inner)));
            }
            '.' => {
                let (segment, next) = parse_member(&chars, pos + 1).map_err(|r| invalid(&r))?;
                segments.push(segment);
                pos = next;
            }
            '[' => {
                let (segment, next) = parse_bracket(&chars, pos).map_err(|r| invalid(&r))?;
                segments.push(segment);
                pos = next;
            }
            other => {
                return Err(invalid(&format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(segments)
}

/// A dotted member name or `*` starting at `pos`.
fn parse_member(chars: &[char], pos: usize) -> std::result::Result<(Segment, usize), String> {
    let mut end = pos;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    let name: String = chars[pos..end].iter().collect();
    match name.as_str() {
        "" => Err("empty member name".to_string()),
        "*" => Ok((Segment::Wildcard, end)),
        _ => Ok((Segment::Key(name), end)),
    }
}

/// A `[...]` subscript whose opening bracket is at `pos`.
fn parse_bracket(chars: &[char], pos: usize) -> std::result::Result<(Segment, usize), String> {
    let mut quote = None;
    let mut close = None;
    for (offset, c) in chars[pos + 1..].iter().enumerate() {
        match (quote, *c) {
            (None, '\'' | '"') => quote = Some(*c),
            (Some(q), c) if c == q => quote = None,
            (None, ']') => {
                close = Some(pos + 1 + offset);
                break;
            }
            _ => {}
        }
    }
    let close = close.ok_or_else(|| "unclosed '['".to_string())?;
    let inner: String = chars[pos + 1..close].iter().collect();

    let members = split_union(inner.trim());
    let segment = if members.len() > 1 {
        Segment::Union(
            members
                .iter()
                .map(|m| parse_subscript(m))
                .collect::<std::result::Result<_, _>>()?,
        )
    } else {
        parse_subscript(inner.trim())?
    };
    Ok((segment, close + 1))
}

fn split_union(inner: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ',') => {
                parts.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(inner[start..].trim());
    parts
}

fn parse_subscript(inner: &str) -> std::result::Result<Segment, String> {
    let quoted = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    if let Some(key) = quoted {
        return Ok(Segment::Key(key.to_string()));
    }

    if inner == "*" {
        return Ok(Segment::Wildcard);
    }

    let bound = |s: &str| -> std::result::Result<Option<i64>, String> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse()
            .map(Some)
            .map_err(|_| format!("invalid slice bound '{}'", s))
    };
    if let Some((start, end)) = inner.split_once(':') {
        return Ok(Segment::Slice {
            start: bound(start)?,
            end: bound(end)?,
        });
    }

    inner
        .parse()
        .map(Segment::Index)
        .map_err(|_| "subscript must be an index, a slice, '*' or a quoted key".to_string())
}
