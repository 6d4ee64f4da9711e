//! Error types for tasksnap-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tasksnap-core
#[derive(Error, Debug)]
pub enum Error {
    /// The population kept outgrowing the buffer
    #[error("capture gave up after {attempts} attempts; population reached {population}")]
    RetryBudgetExhausted {
        /// Fill attempts made
        attempts: u32,
        /// Population reported by the last attempt
        population: usize,
    },

    /// The task source detected an inconsistency in its own state
    #[error("task source corrupted: {0}")]
    SourceCorrupted(String),

    /// Configuration could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration parsed but holds an unusable value
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the capturer stops for good rather than retrying.
    ///
    /// Growth retries never surface as errors, so every capture error is
    /// fatal; configuration and export errors are caller mistakes.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RetryBudgetExhausted { .. } | Self::SourceCorrupted(_)
        )
    }
}
