//! Agent error types
//!
//! Failures of the credential helper never surface here: the fetcher maps
//! them to `FetchError` so the refresh policy can retry them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Sink write failed for {path}: {source}")]
    Sink {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias using agent Error
pub type Result<T> = std::result::Result<T, Error>;
