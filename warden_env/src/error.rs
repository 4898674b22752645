//! Error types for the Warden environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// An identifier string could not be parsed
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

impl EnvError {
    /// Creates an invalid-identifier error.
    pub fn invalid_id(raw: impl std::fmt::Display) -> Self {
        Self::InvalidId(raw.to_string())
    }
}
