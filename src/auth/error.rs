//! Authentication error taxonomy.
//!
//! The verifier and acquirer return these; only the auth gate turns them
//! into HTTP responses (see [`crate::gateway::auth::rejection_response`]).

use std::time::Duration;

use thiserror::Error;

/// Failure of a bearer-token flow.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable bearer token on the request.
    #[error("Missing or invalid authorization")]
    MissingToken,

    /// Malformed token, missing or unknown `kid`, disallowed algorithm, or bad signature.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Signature is valid but `exp` has passed.
    #[error("JWT token has expired")]
    TokenExpired,

    /// Audience, issuer or another required claim did not match.
    #[error("Invalid token claims: {0}")]
    ClaimsInvalid(String),

    /// The JWKS endpoint could not be reached or returned an unusable body.
    #[error("Signing key set unavailable: {0}")]
    KeySetUnavailable(String),

    /// The verified token lacks scopes a handler requires.
    #[error("Insufficient scope: missing {}", missing.join(", "))]
    InsufficientScope {
        /// Scopes the handler declared.
        required: Vec<String>,
        /// Required scopes absent from the token.
        missing: Vec<String>,
    },

    /// The token endpoint rejected the client-credentials request.
    #[error("Token acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// The token endpoint did not answer in time.
    #[error("Token request timed out after {}s", .0.as_secs())]
    RequestTimeout(Duration),

    /// Anything unexpected. Never echoed to clients.
    #[error("Internal authentication error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable code used in error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "unauthorized",
            Self::InvalidToken(_) => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::ClaimsInvalid(_) => "forbidden",
            Self::KeySetUnavailable(_) => "service_unavailable",
            Self::InsufficientScope { .. } => "insufficient_scope",
            Self::AcquisitionFailed(_) => "token_acquisition_failed",
            Self::RequestTimeout(_) => "request_timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether a client may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeySetUnavailable(_) | Self::RequestTimeout(_) | Self::Internal(_)
        )
    }
}
