//! HTTP server: auth gate, routes and lifecycle

pub mod auth;
pub mod router;
mod server;

pub use auth::{AuthGate, auth_middleware, rejection_response};
pub use router::{AppState, create_router};
pub use server::Gateway;
