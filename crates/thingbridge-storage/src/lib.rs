//! ThingBridge Storage
//!
//! Drivers persist thing definitions and hand out per property value stores.
//! Drivers are created by name through a [`DriverRegistry`]; the built-in
//! `memory` driver keeps everything in process memory.
//!
//! ```rust,no_run
//! use thingbridge_storage::DriverRegistry;
//!
//! # fn demo() -> thingbridge_core::Result<()> {
//! let drivers = DriverRegistry::with_builtins();
//! let driver = drivers.open("memory", "")?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod memory;
pub mod value_store;

pub use driver::{DeleteOptions, Driver, DriverFactory, DriverRegistry, SetOptions};
pub use memory::{MemoryDriver, MemoryValueStore};
pub use value_store::{Observation, ValueStore};
