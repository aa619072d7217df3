//! In-memory storage driver.
//!
//! Keeps thing definitions and value logs in process memory. Nothing
//! survives a restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use thingbridge_core::{CancelableLock, CancellationToken, Error, Result, Thing};

use crate::driver::{DeleteOptions, Driver, SetOptions};
use crate::value_store::{Observation, ValueStore};

/// Name the memory driver is registered under.
pub const DRIVER_NAME: &str = "memory";

#[derive(Default)]
struct MemoryState {
    things: HashMap<String, Arc<Thing>>,
    /// Keyed by (thing ID, property ID).
    stores: HashMap<(String, String), Arc<MemoryValueStore>>,
}

/// Memory backed [`Driver`].
///
/// A single lock guards both the thing table and the value store table.
#[derive(Default)]
pub struct MemoryDriver {
    state: CancelableLock<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the driver from a registry options string.
    ///
    /// The memory driver has no options; anything passed is ignored.
    pub fn from_options(options: &str) -> Result<Self> {
        if !options.trim().is_empty() {
            tracing::warn!(options = %options, "Memory driver ignores its options");
        }
        Ok(Self::new())
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn get(&self, cancel: &CancellationToken, id: &str) -> Result<Arc<Thing>> {
        let state = self.state.try_lock(cancel).await.ok_or(Error::Canceled)?;

        state
            .things
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("thing {}", id)))
    }

    async fn set(
        &self,
        cancel: &CancellationToken,
        thing: Arc<Thing>,
        options: SetOptions,
    ) -> Result<()> {
        options.validate()?;

        let mut state = self.state.try_lock(cancel).await.ok_or(Error::Canceled)?;
        let exists = state.things.contains_key(&thing.id);

        if options.create_only && exists {
            return Err(Error::AlreadyExists(format!("thing {}", thing.id)));
        }
        if options.update_only && !exists {
            return Err(Error::NotFound(format!("thing {}", thing.id)));
        }

        state.things.insert(thing.id.clone(), thing);
        Ok(())
    }

    async fn delete(
        &self,
        cancel: &CancellationToken,
        id: &str,
        options: DeleteOptions,
    ) -> Result<Option<Arc<Thing>>> {
        let mut state = self.state.try_lock(cancel).await.ok_or(Error::Canceled)?;

        match state.things.remove(id) {
            Some(thing) => Ok(Some(thing)),
            None if options.must_exist => Err(Error::NotFound(format!("thing {}", id))),
            None => Ok(None),
        }
    }

    async fn has(&self, cancel: &CancellationToken, id: &str) -> Result<bool> {
        let state = self.state.try_lock(cancel).await.ok_or(Error::Canceled)?;
        Ok(state.things.contains_key(id))
    }

    async fn ids(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let state = self.state.try_lock(cancel).await.ok_or(Error::Canceled)?;
        Ok(state.things.keys().cloned().collect())
    }

    async fn value_store(
        &self,
        cancel: &CancellationToken,
        thing_id: &str,
        property_id: &str,
    ) -> Result<Arc<dyn ValueStore>> {
        let mut state = self.state.try_lock(cancel).await.ok_or(Error::Canceled)?;

        let store = state
            .stores
            .entry((thing_id.to_string(), property_id.to_string()))
            .or_insert_with(|| Arc::new(MemoryValueStore::new(thing_id, property_id)))
            .clone();

        Ok(store)
    }
}

/// Memory backed [`ValueStore`].
pub struct MemoryValueStore {
    thing_id: String,
    property_id: String,
    log: CancelableLock<Vec<Observation>>,
}

impl MemoryValueStore {
    pub fn new(thing_id: impl Into<String>, property_id: impl Into<String>) -> Self {
        Self {
            thing_id: thing_id.into(),
            property_id: property_id.into(),
            log: CancelableLock::new(Vec::new()),
        }
    }

    pub fn thing_id(&self) -> &str {
        &self.thing_id
    }

    pub fn property_id(&self) -> &str {
        &self.property_id
    }
}

#[async_trait]
impl ValueStore for MemoryValueStore {
    async fn put(&self, cancel: &CancellationToken, value: Value) -> Result<()> {
        let mut log = self.log.try_lock(cancel).await.ok_or(Error::Canceled)?;
        log.push(Observation {
            value,
            observed_at: Utc::now(),
        });
        Ok(())
    }

    async fn current(&self, cancel: &CancellationToken) -> Result<Option<Value>> {
        let log = self.log.try_lock(cancel).await.ok_or(Error::Canceled)?;
        Ok(log.last().map(|o| o.value.clone()))
    }

    async fn filter(
        &self,
        cancel: &CancellationToken,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<BoxStream<'static, Observation>> {
        let _log = self.log.try_lock(cancel).await.ok_or(Error::Canceled)?;
        Err(Error::NotImplemented(format!(
            "time range queries on {}/{}",
            self.thing_id, self.property_id
        )))
    }

    async fn clear(&self, cancel: &CancellationToken) -> Result<()> {
        let mut log = self.log.try_lock(cancel).await.ok_or(Error::Canceled)?;
        log.clear();
        Ok(())
    }

    async fn history(&self, cancel: &CancellationToken) -> Result<Vec<Observation>> {
        let log = self.log.try_lock(cancel).await.ok_or(Error::Canceled)?;
        Ok(log.clone())
    }
}
