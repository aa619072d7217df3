//! Storage driver contract and the driver factory registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thingbridge_core::{CancellationToken, Error, Result, Thing};

use crate::value_store::ValueStore;

/// Options of [`Driver::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Fail with `AlreadyExists` if the thing is already stored.
    pub create_only: bool,
    /// Fail with `NotFound` if the thing is not stored yet.
    pub update_only: bool,
}

impl SetOptions {
    pub fn create_only() -> Self {
        Self {
            create_only: true,
            update_only: false,
        }
    }

    pub fn update_only() -> Self {
        Self {
            create_only: false,
            update_only: true,
        }
    }

    /// Rejects options that can never be satisfied.
    pub fn validate(&self) -> Result<()> {
        if self.create_only && self.update_only {
            return Err(Error::InvalidOptions(
                "create_only and update_only are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options of [`Driver::delete`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Fail with `NotFound` if the thing is not stored.
    pub must_exist: bool,
}

impl DeleteOptions {
    pub fn must_exist() -> Self {
        Self { must_exist: true }
    }
}

/// Storage for thing definitions and their property values.
///
/// Every operation takes a cancellation token and fails with
/// [`Error::Canceled`] if it fires before the driver could serve the request.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The thing stored under `id`, or `NotFound`.
    async fn get(&self, cancel: &CancellationToken, id: &str) -> Result<Arc<Thing>>;

    /// Store a complete thing definition.
    async fn set(
        &self,
        cancel: &CancellationToken,
        thing: Arc<Thing>,
        options: SetOptions,
    ) -> Result<()>;

    /// Remove a thing and return the removed record.
    ///
    /// A missing thing yields `Ok(None)` unless `must_exist` is set.
    async fn delete(
        &self,
        cancel: &CancellationToken,
        id: &str,
        options: DeleteOptions,
    ) -> Result<Option<Arc<Thing>>>;

    async fn has(&self, cancel: &CancellationToken, id: &str) -> Result<bool>;

    /// IDs of all stored things, in no particular order.
    async fn ids(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// The value store of a property, created on first access.
    async fn value_store(
        &self,
        cancel: &CancellationToken,
        thing_id: &str,
        property_id: &str,
    ) -> Result<Arc<dyn ValueStore>>;
}

/// Creates a driver from an options string.
pub type DriverFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Maps driver names to factories.
#[derive(Default)]
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `memory` driver.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.must_register(crate::memory::DRIVER_NAME, |options| {
            Ok(Arc::new(crate::memory::MemoryDriver::from_options(options)?) as Arc<dyn Driver>)
        });
        registry
    }

    /// Register a factory. Names must be unique.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&str) -> Result<Arc<dyn Driver>> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);

        if factories.contains_key(&name) {
            return Err(Error::AlreadyRegistered(format!("driver '{}'", name)));
        }

        tracing::debug!(driver = %name, "Registered storage driver");
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Register a factory and panic if the name is taken.
    pub fn must_register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn Driver>> + Send + Sync + 'static,
    {
        if let Err(e) = self.register(name, factory) {
            panic!("failed to register storage driver: {}", e);
        }
    }

    /// Create a driver instance.
    pub fn open(&self, name: &str, options: &str) -> Result<Arc<dyn Driver>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("storage driver '{}'", name)))?;

        // the factory runs without the registry lock held
        factory(options)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
