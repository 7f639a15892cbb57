//! Error types for sonda

use thiserror::Error;

/// Main error type for session construction and configuration.
///
/// Per-probe failures are not represented here: they travel inside the
/// response stream (see `sonda-engine`) so that one failed probe never
/// aborts a running session.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("host lookup failed for {host}: {message}")]
    Resolution { host: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, Error>;
