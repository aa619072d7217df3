//! Error types shared by all ThingBridge crates.

use std::fmt;

use thiserror::Error;

/// Result type for ThingBridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// ThingBridge error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown thing, property, driver or handler type.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A record with the same identity already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A driver factory or payload handler type with the same name is already registered.
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Conflicting or otherwise invalid operation options.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The handler spec names a type that is not a string or not registered.
    #[error("Invalid handler type: {0}")]
    InvalidType(String),

    /// The handler spec has no `type` key.
    #[error("No handler type")]
    NoType,

    /// A payload handler produced a result of an unsupported kind.
    #[error("Invalid result: {0}")]
    InvalidResult(String),

    /// The operation was abandoned because its cancellation token fired.
    #[error("Operation canceled")]
    Canceled,

    /// The capability is declared but not built.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// One or more field level problems.
    #[error("Validation failed: {0}")]
    Validation(ValidationError),

    /// Topic or payload template rendering failed.
    #[error("Template error: {0}")]
    Templating(String),

    /// A payload handler failed to extract a value.
    #[error("Payload handler error: {0}")]
    Handler(String),

    /// Transport (subscribe, unsubscribe, publish, ack) failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

/// Aggregate of every problem found while validating a thing.
///
/// Validation never stops at the first problem; all of them end up here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    problems: Vec<String>,
}

impl ValidationError {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a problem.
    pub fn add(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }

    /// Record every problem of another report, prefixed with `scope`.
    pub fn extend_scoped(&mut self, scope: &str, other: ValidationError) {
        for p in other.problems {
            self.problems.push(format!("{}: {}", scope, p));
        }
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    /// `Ok(())` if nothing was recorded, otherwise the report as an error.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.problems.is_empty() {
            return write!(f, "<noerror>");
        }
        write!(f, "{}", self.problems.join("; "))
    }
}
