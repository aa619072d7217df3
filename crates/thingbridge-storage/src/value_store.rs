//! Per property value logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use thingbridge_core::{CancellationToken, Result};

/// A value together with the time it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub value: Value,
    pub observed_at: DateTime<Utc>,
}

/// Append-only log of the values observed for one property of one thing.
///
/// Every operation waits for the store's lock and fails with
/// [`Error::Canceled`](thingbridge_core::Error::Canceled) if `cancel` fires
/// first.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Append a value observed now.
    async fn put(&self, cancel: &CancellationToken, value: Value) -> Result<()>;

    /// The most recently stored value. `None` if nothing was stored yet.
    async fn current(&self, cancel: &CancellationToken) -> Result<Option<Value>>;

    /// Values observed within `[from, to]`.
    async fn filter(
        &self,
        cancel: &CancellationToken,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BoxStream<'static, Observation>>;

    /// Remove every stored value. The store itself stays usable.
    async fn clear(&self, cancel: &CancellationToken) -> Result<()>;

    /// All observations in the order they were stored.
    async fn history(&self, cancel: &CancellationToken) -> Result<Vec<Observation>>;
}
