//! Configuration error type.

use thiserror::Error;

/// Errors raised while loading or validating process configuration.
///
/// Any of these aborts startup with exit code 1.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A required setting was absent for the selected mode.
    #[error("missing required setting {key}: {reason}")]
    Missing {
        /// Environment variable name.
        key: String,
        /// Why the setting is required.
        reason: String,
    },
}

impl ConfigError {
    /// Convenience constructor for invalid values.
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for missing settings.
    pub fn missing(key: &str, reason: impl Into<String>) -> Self {
        Self::Missing {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
