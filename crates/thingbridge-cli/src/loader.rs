//! Thing definition files.
//!
//! A things directory holds one thing per file, JSON (`.json`) or YAML
//! (`.yaml`, `.yml`). Files with other extensions and subdirectories are
//! skipped.

use std::path::Path;

use thingbridge_core::{Error, HandlerRegistry, Result, Thing};
use tracing::debug;

enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Option<Format> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "json" => Some(Format::Json),
        "yaml" | "yml" => Some(Format::Yaml),
        _ => None,
    }
}

/// Parse a single definition file. `Ok(None)` for unsupported extensions.
pub fn read_thing(path: &Path) -> Result<Option<Thing>> {
    let Some(format) = format_of(path) else {
        return Ok(None);
    };

    let content = std::fs::read_to_string(path)?;
    let thing = match format {
        Format::Json => serde_json::from_str(&content)?,
        Format::Yaml => serde_yaml::from_str(&content)
            .map_err(|e| Error::Serialization(format!("invalid YAML: {}", e)))?,
    };
    Ok(Some(thing))
}

/// Apply defaults and validate a freshly read thing.
pub fn prepare(mut thing: Thing, handlers: &HandlerRegistry) -> Result<Thing> {
    thing.apply_defaults()?;
    thing.validate(handlers)?;
    Ok(thing)
}

/// Read, default and validate every thing in `dir`, ordered by file name.
///
/// Errors name the offending file.
pub fn load_things(dir: &Path, handlers: &HandlerRegistry) -> Result<Vec<Thing>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::Config(format!("failed to read things directory {}: {}", dir.display(), e))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut things = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let thing = match read_thing(&path) {
            Ok(Some(thing)) => thing,
            Ok(None) => {
                debug!(file = %name, "Skipping file without thing definition extension");
                continue;
            }
            Err(e) => return Err(Error::Config(format!("{}: {}", name, e))),
        };

        let thing =
            prepare(thing, handlers).map_err(|e| Error::Config(format!("{}: {}", name, e)))?;
        debug!(file = %name, thing_id = %thing.id, "Loaded thing definition");
        things.push(thing);
    }

    Ok(things)
}
