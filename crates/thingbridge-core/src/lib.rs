//! ThingBridge Core
//!
//! Shared building blocks of the ThingBridge gateway:
//!
//! - [`sync`]: the cancelable lock guarding every shared table
//! - [`thing`]: thing and property descriptions, defaults and validation
//! - [`template`]: topic and payload templates
//! - [`payload`]: pluggable payload handlers turning transport bytes into values
//! - [`error`]: the error taxonomy used across all crates

pub mod error;
pub mod payload;
pub mod sync;
pub mod template;
pub mod thing;

pub use error::{Error, Result, ValidationError};
pub use payload::{HandlerRegistry, HandlerSpec, PayloadHandler, PayloadParser, ResolvedHandler};
pub use sync::{CancelableLock, CancelableLockGuard};
pub use template::TemplateContext;
pub use thing::{render_template, Primitive, Property, PropertyTransport, Thing, ThingTransport};

/// Re-exported so downstream crates share one cancellation token type.
pub use tokio_util::sync::CancellationToken;
