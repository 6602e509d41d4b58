//! Error handling for telewatch-rs
//!
//! This module defines the crate error type and a Result alias for use
//! throughout the telemetry core. Each component reports failures as a value
//! at its operation boundary; nothing here is logged and swallowed.

use thiserror::Error;

/// Main error type for telewatch-rs operations
#[derive(Error, Debug)]
pub enum TelewatchError {
    /// Malformed frame: too short, wrong direction bit or bad length field
    #[error("Framing error: {0}")]
    Framing(String),

    /// CRC trailer does not match the frame contents
    #[error("Integrity error: expected CRC 0x{expected:08X}, computed 0x{computed:08X}")]
    Integrity { expected: u32, computed: u32 },

    /// Datastore full or duplicate entry id
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Memory image merge not anchored on the latest write
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Read outside of a known memory chunk or reference to an unknown id
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Device link failure (broken pipe, link not operational, ...)
    #[error("Link error: {0}")]
    Link(String),

    /// A request record was completed more than once
    #[error("Request already completed: {0}")]
    DoubleCompletion(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Client API request that cannot be served
    #[error("API error: {0}")]
    Api(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<TelewatchError>,
    },
}

impl TelewatchError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        TelewatchError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &TelewatchError {
        match self {
            TelewatchError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for errors that leave the device link desynchronized
    pub fn requires_link_reset(&self) -> bool {
        matches!(self.root(), TelewatchError::Framing(_) | TelewatchError::Link(_))
    }
}

impl From<serde_json::Error> for TelewatchError {
    fn from(err: serde_json::Error) -> Self {
        TelewatchError::Serialization(err.to_string())
    }
}

/// Result type alias for telewatch-rs operations
pub type Result<T> = std::result::Result<T, TelewatchError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
