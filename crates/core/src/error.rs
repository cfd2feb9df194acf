//! Core error types for Keystone operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for Keystone core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Keystone operations.
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("JSON parse error in '{path}': {reason}")]
    JsonParseFailed { path: PathBuf, reason: String },

    #[error("YAML parse error in '{path}': {reason}")]
    YamlParseFailed { path: PathBuf, reason: String },

    #[error("TOML parse error in '{path}': {reason}")]
    TomlParseFailed { path: PathBuf, reason: String },

    #[error("unsupported file format '{path}': expected .toml, .yaml, .yml or .json")]
    UnsupportedFormat { path: PathBuf },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_read_failed_display() {
        let err = Error::file_read_failed("/etc/keystone.toml", "permission denied");
        let msg = err.to_string();
        assert!(msg.contains("/etc/keystone.toml"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_invalid_config_display() {
        let err = Error::invalid_config("workers must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid configuration: workers must be at least 1"
        );
    }
}
