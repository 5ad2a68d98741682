//! Error types for the testlog pipeline.
//!
//! Capturing output must never fail the unit under test, so most of the
//! capture path swallows its own failures. The errors below surface only at
//! construction and configuration time, where a bad option should be
//! reported immediately rather than silently clamped.

use thiserror::Error;

/// Result type alias for testlog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for testlog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid option value (non-positive sizes, zero caps, ...).
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A filter pattern failed to compile.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A named framework preset does not exist.
    #[error("Unknown framework preset: {name}")]
    UnknownPreset { name: String },

    /// Two numeric vectors of different lengths were compared.
    #[error("Vector length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    /// A process-wide hook is already owned by someone else.
    #[error("{hook} is already installed")]
    AlreadyInstalled { hook: String },

    /// A requested resource was not found.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Serialization of a record failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        source: Box<Error>,
    },
}

impl Error {
    /// Creates a Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an InvalidPattern error.
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Creates an UnknownPreset error.
    pub fn unknown_preset(name: impl Into<String>) -> Self {
        Self::UnknownPreset { name: name.into() }
    }

    /// Creates an AlreadyInstalled error.
    pub fn already_installed(hook: impl Into<String>) -> Self {
        Self::AlreadyInstalled { hook: hook.into() }
    }

    /// Creates a NotFound error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Adds context to an error.
    ///
    /// # Example
    /// ```
    /// use testlog_common::{Error, Result};
    ///
    /// fn inner() -> Result<()> {
    ///     Err(Error::validation("max_bytes must be greater than 0"))
    /// }
    ///
    /// fn outer() -> Result<()> {
    ///     inner().map_err(|e| e.context("Failed to build capture buffer"))
    /// }
    /// ```
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::WithContext {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Returns true for configuration-time errors.
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Validation { .. } | Error::InvalidPattern { .. } | Error::UnknownPreset { .. } => {
                true
            }
            Error::WithContext { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Convenience methods for Result types
pub trait ResultExt<T> {
    /// Adds context to an error result.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(message))
    }
}
