//! Error types for toolgate

use std::io;

use thiserror::Error;

/// Result type alias for toolgate
pub type Result<T> = std::result::Result<T, Error>;

/// Library-level errors (startup, configuration, I/O).
///
/// Request-path failures use the narrower [`AuthError`](crate::auth::AuthError)
/// and [`ToolError`](crate::tools::ToolError) types instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Authentication error surfaced outside the request path (CLI commands)
    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
