//! toolgate library
//!
//! Tool-style HTTP endpoints behind OAuth 2.0 bearer-token authentication,
//! with long-running tool executions streamed to clients as server-push
//! progress events.
//!
//! # Components
//!
//! - **Key set cache**: remote JWKS fetched on demand, replaced on refresh
//! - **Token verifier**: JWT signature, expiry, audience and issuer checks
//! - **Token acquirer**: cached client-credentials access tokens
//! - **Auth gate**: axum middleware attaching the verified identity to requests
//! - **Stream hub**: per-request FIFO event channels with keepalive frames
//! - **Streaming tool wrapper**: runs a blocking tool and reports its lifecycle

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod streaming;
pub mod tools;

pub use error::{Error, Result};
pub use toolgate_core::{EventType, KEEPALIVE_FRAME, StreamEvent};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}"))),
    }
}
