//! Thing registry with change notification.
//!
//! The registry wraps one storage [`Driver`] and tells interested parties
//! about created, updated and deleted things. Notifier callbacks run on their
//! own tasks; the operation that triggered them returns as soon as the driver
//! succeeded. Callbacks are not ordered relative to each other.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use thingbridge_core::{CancellationToken, Result, Thing};
use thingbridge_storage::{DeleteOptions, Driver, DriverRegistry, SetOptions, ValueStore};
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Callback invoked with the affected thing.
pub type Notifier = Arc<dyn Fn(Arc<Thing>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`Notifier`].
pub fn notifier<F, Fut>(f: F) -> Notifier
where
    F: Fn(Arc<Thing>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |thing| Box::pin(f(thing)))
}

/// Kind of registry change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Deleted,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::Created => "created",
            Change::Updated => "updated",
            Change::Deleted => "deleted",
        }
    }
}

#[derive(Default)]
struct Notifiers {
    created: Vec<Notifier>,
    updated: Vec<Notifier>,
    deleted: Vec<Notifier>,
}

impl Notifiers {
    fn list_mut(&mut self, change: Change) -> &mut Vec<Notifier> {
        match change {
            Change::Created => &mut self.created,
            Change::Updated => &mut self.updated,
            Change::Deleted => &mut self.deleted,
        }
    }

    fn list(&self, change: Change) -> &[Notifier] {
        match change {
            Change::Created => &self.created,
            Change::Updated => &self.updated,
            Change::Deleted => &self.deleted,
        }
    }
}

/// Stores thing definitions and notifies about changes.
pub struct Registry {
    driver: Arc<dyn Driver>,
    notifiers: RwLock<Notifiers>,
    tasks: TaskTracker,
}

impl Registry {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            notifiers: RwLock::new(Notifiers::default()),
            tasks: TaskTracker::new(),
        }
    }

    /// Open the registry on the driver registered as `driver_name`.
    pub fn open(drivers: &DriverRegistry, driver_name: &str, options: &str) -> Result<Self> {
        let driver = drivers.open(driver_name, options)?;
        debug!(driver = %driver_name, "Opened thing registry");
        Ok(Self::new(driver))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// All stored things.
    ///
    /// Things deleted while the listing is in progress are skipped, so the
    /// result is a best-effort snapshot.
    pub async fn all(&self, cancel: &CancellationToken) -> Result<Vec<Arc<Thing>>> {
        let ids = self.driver.ids(cancel).await?;
        let mut things = Vec::with_capacity(ids.len());

        for id in ids {
            match self.driver.get(cancel, &id).await {
                Ok(thing) => things.push(thing),
                Err(e) if e.is_not_found() => {
                    debug!(thing_id = %id, "Thing vanished while listing");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(things)
    }

    pub async fn get(&self, cancel: &CancellationToken, id: &str) -> Result<Arc<Thing>> {
        self.driver.get(cancel, id).await
    }

    /// Store a new thing. Fails with `AlreadyExists` if the ID is taken.
    pub async fn create(&self, cancel: &CancellationToken, thing: Thing) -> Result<Arc<Thing>> {
        let thing = Arc::new(thing);
        self.driver
            .set(cancel, thing.clone(), SetOptions::create_only())
            .await?;

        self.notify(Change::Created, thing.clone());
        Ok(thing)
    }

    /// Replace an existing thing. Fails with `NotFound` if it is not stored.
    pub async fn update(&self, cancel: &CancellationToken, thing: Thing) -> Result<Arc<Thing>> {
        let thing = Arc::new(thing);
        self.driver
            .set(cancel, thing.clone(), SetOptions::update_only())
            .await?;

        self.notify(Change::Updated, thing.clone());
        Ok(thing)
    }

    /// Remove a thing. Fails with `NotFound` if it is not stored.
    pub async fn delete(&self, cancel: &CancellationToken, id: &str) -> Result<Arc<Thing>> {
        let removed = self
            .driver
            .delete(cancel, id, DeleteOptions::must_exist())
            .await?
            .ok_or_else(|| thingbridge_core::Error::NotFound(format!("thing {}", id)))?;

        self.notify(Change::Deleted, removed.clone());
        Ok(removed)
    }

    pub async fn value_store(
        &self,
        cancel: &CancellationToken,
        thing_id: &str,
        property_id: &str,
    ) -> Result<Arc<dyn ValueStore>> {
        self.driver.value_store(cancel, thing_id, property_id).await
    }

    /// The current value of a property, `None` if nothing was stored yet.
    pub async fn get_item_value(
        &self,
        cancel: &CancellationToken,
        thing_id: &str,
        property_id: &str,
    ) -> Result<Option<Value>> {
        let store = self.value_store(cancel, thing_id, property_id).await?;
        store.current(cancel).await
    }

    pub fn register_created_notifier(&self, notifier: Notifier) {
        self.register(Change::Created, notifier);
    }

    pub fn register_updated_notifier(&self, notifier: Notifier) {
        self.register(Change::Updated, notifier);
    }

    pub fn register_deleted_notifier(&self, notifier: Notifier) {
        self.register(Change::Deleted, notifier);
    }

    fn register(&self, change: Change, notifier: Notifier) {
        self.notifiers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .list_mut(change)
            .push(notifier);
    }

    fn notify(&self, change: Change, thing: Arc<Thing>) {
        let notifiers: Vec<Notifier> = self
            .notifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list(change)
            .to_vec();

        debug!(
            thing_id = %thing.id,
            change = change.as_str(),
            notifiers = notifiers.len(),
            "Dispatching thing notification"
        );

        for notifier in notifiers {
            self.tasks.spawn(notifier(thing.clone()));
        }
    }

    /// Wait until every notifier callback spawned so far has finished.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
