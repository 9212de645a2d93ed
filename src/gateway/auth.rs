//! Auth gate middleware
//!
//! Supports:
//! - Bearer token in the `Authorization` header
//! - Token in a query parameter, for stream routes only (`EventSource`
//!   cannot set headers)
//! - Exempt paths that bypass authentication entirely
//!
//! This module is the only place where an [`AuthError`] becomes an HTTP
//! response.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, TokenVerifier};
use crate::config::AuthConfig;

/// Auth gate settings plus the verifier it delegates to.
pub struct AuthGate {
    /// Whether tokens are required at all
    pub enabled: bool,
    verifier: Option<Arc<TokenVerifier>>,
    exempt_paths: Vec<String>,
    stream_prefix: String,
    token_query_param: String,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.enabled)
            .field("exempt_paths", &self.exempt_paths)
            .field("stream_prefix", &self.stream_prefix)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    /// Build the gate. A gate without a verifier lets every request through.
    #[must_use]
    pub fn new(config: &AuthConfig, verifier: Option<Arc<TokenVerifier>>) -> Self {
        let enabled = config.enabled && verifier.is_some();
        if config.enabled && !enabled {
            warn!("Auth enabled in config but no verifier configured; requests are not authenticated");
        }
        info!(exempt_paths = ?config.exempt_paths, enabled, "Auth gate initialized");
        Self {
            enabled,
            verifier,
            exempt_paths: config.exempt_paths.clone(),
            stream_prefix: config.stream_prefix.clone(),
            token_query_param: config.token_query_param.clone(),
        }
    }

    /// Whether `path` bypasses authentication (exact match).
    #[must_use]
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }

    /// Pull the bearer token from a request.
    ///
    /// A present `Authorization` header must be `Bearer <token>`; the query
    /// parameter is consulted only when the header is absent and the path is
    /// a stream route.
    #[must_use]
    pub fn extract_token<'a>(&self, request: &'a Request<Body>) -> Option<std::borrow::Cow<'a, str>> {
        if let Some(value) = request.headers().get(header::AUTHORIZATION) {
            let value = value.to_str().ok()?;
            let mut parts = value.split_whitespace();
            let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
                return None;
            };
            return scheme
                .eq_ignore_ascii_case("bearer")
                .then_some(std::borrow::Cow::Borrowed(token));
        }

        if request.uri().path().starts_with(&self.stream_prefix) {
            let query = request.uri().query()?;
            return url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == self.token_query_param.as_str())
                .map(|(_, value)| value)
                .filter(|value| !value.is_empty());
        }

        None
    }

    /// Name of the query parameter that may carry the token.
    #[must_use]
    pub fn token_query_param(&self) -> &str {
        &self.token_query_param
    }
}

/// Authentication middleware
///
/// On success the [`VerifiedIdentity`](crate::auth::VerifiedIdentity) is
/// inserted into the request extensions for downstream handlers.
pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(verifier) = gate.verifier.as_ref().filter(|_| gate.enabled) else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    let method = request.method().clone();
    if gate.is_exempt(&path) {
        debug!(method = %method, path = %path, "Exempt path, skipping auth");
        return next.run(request).await;
    }

    let Some(token) = gate.extract_token(&request).map(std::borrow::Cow::into_owned) else {
        warn!(path = %path, method = %method, "Missing or invalid authorization");
        return rejection_response(&AuthError::MissingToken);
    };

    let verification = AssertUnwindSafe(verifier.validate(&token))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(AuthError::Internal("token verification panicked".to_string())));

    match verification {
        Ok(identity) => {
            info!(
                subject = %identity.subject,
                path = %path,
                method = %method,
                "Request authenticated"
            );
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => {
            match &err {
                AuthError::KeySetUnavailable(_) | AuthError::Internal(_) => {
                    error!(path = %path, method = %method, error = %err, "Token verification unavailable");
                }
                _ => warn!(path = %path, method = %method, error = %err, "Token rejected"),
            }
            rejection_response(&err)
        }
    }
}

/// Translate an [`AuthError`] into the `{error, message, details}` body.
///
/// Outage and internal errors get generic text; their detail stays in the logs.
#[must_use]
pub fn rejection_response(err: &AuthError) -> Response {
    let (status, message, details) = match err {
        AuthError::MissingToken => (
            StatusCode::UNAUTHORIZED,
            err.to_string(),
            "Please provide a valid JWT token in the Authorization header or token query parameter"
                .to_string(),
        ),
        AuthError::TokenExpired => (
            StatusCode::UNAUTHORIZED,
            err.to_string(),
            "Please obtain a new access token".to_string(),
        ),
        AuthError::InvalidToken(_) => (
            StatusCode::UNAUTHORIZED,
            err.to_string(),
            "Token validation failed".to_string(),
        ),
        AuthError::ClaimsInvalid(_) => (
            StatusCode::FORBIDDEN,
            err.to_string(),
            "Token validation failed".to_string(),
        ),
        AuthError::InsufficientScope { required, .. } => (
            StatusCode::FORBIDDEN,
            "Insufficient permissions to access this resource".to_string(),
            format!("Required scopes: {}", required.join(", ")),
        ),
        AuthError::KeySetUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Unable to validate token".to_string(),
            "Authentication service temporarily unavailable".to_string(),
        ),
        AuthError::AcquisitionFailed(_) => (
            StatusCode::BAD_GATEWAY,
            "Failed to obtain access token".to_string(),
            "Token endpoint rejected the request".to_string(),
        ),
        AuthError::RequestTimeout(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            err.to_string(),
            "Token endpoint did not respond in time".to_string(),
        ),
        AuthError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An unexpected error occurred during authentication".to_string(),
            "Internal error".to_string(),
        ),
    };

    let body = Json(json!({
        "error": err.code(),
        "message": message,
        "details": details,
    }));

    if status == StatusCode::UNAUTHORIZED {
        (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
    } else {
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::KeySetCache;

    fn gate() -> AuthGate {
        let keys = Arc::new(KeySetCache::new(
            "http://127.0.0.1:9/jwks.json",
            Duration::from_millis(100),
        ));
        let verifier = Arc::new(TokenVerifier::new(keys, "aud", "iss"));
        AuthGate::new(&AuthConfig::default(), Some(verifier))
    }

    fn request(uri: &str, authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn exempt_paths_match_exactly() {
        let gate = gate();
        assert!(gate.is_exempt("/health"));
        assert!(gate.is_exempt("/"));
        assert!(!gate.is_exempt("/health/deep"));
        assert!(!gate.is_exempt("/tools/file_operations"));
    }

    #[test]
    fn extracts_bearer_header_case_insensitively() {
        let gate = gate();
        let req = request("/whoami", Some("bearer abc.def.ghi"));
        assert_eq!(gate.extract_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn rejects_malformed_header() {
        let gate = gate();
        assert!(gate.extract_token(&request("/whoami", Some("Basic dXNlcg=="))).is_none());
        assert!(gate.extract_token(&request("/whoami", Some("Bearer"))).is_none());
        assert!(gate.extract_token(&request("/whoami", Some("Bearer a b"))).is_none());
    }

    #[test]
    fn query_token_only_on_stream_routes() {
        let gate = gate();
        let stream = request("/stream/file_operations?operation=read&token=abc%2Edef", None);
        let other = request("/tools/file_operations?token=abc", None);

        assert_eq!(gate.extract_token(&stream).as_deref(), Some("abc.def"));
        assert!(gate.extract_token(&other).is_none());
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let gate = gate();
        let req = request("/stream/x?token=from-query", Some("Bearer from-header"));
        assert_eq!(gate.extract_token(&req).as_deref(), Some("from-header"));
    }

    #[test]
    fn unauthorized_carries_challenge_header() {
        let response = rejection_response(&AuthError::TokenExpired);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn status_per_error_kind() {
        assert_eq!(
            rejection_response(&AuthError::ClaimsInvalid("aud".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            rejection_response(&AuthError::KeySetUnavailable("down".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            rejection_response(&AuthError::Internal("secret detail".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn exempt_request_log_names_method_and_path() {
        use axum::{Router, middleware::from_fn_with_state, routing::post};
        use tower::ServiceExt;

        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let app = Router::new()
            .route("/health", post(|| async { "ok" }))
            .layer(from_fn_with_state(Arc::new(gate()), auth_middleware));
        let request = Request::builder()
            .method("POST")
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let response = tracing::subscriber::with_default(subscriber, || {
            runtime.block_on(app.oneshot(request))
        })
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert!(output.contains("Exempt path, skipping auth"), "{output}");
        assert!(output.contains("method=POST"), "{output}");
        assert!(output.contains("path=/health"), "{output}");
    }

    #[test]
    fn gate_without_verifier_is_disabled() {
        let gate = AuthGate::new(&AuthConfig::default(), None);
        assert!(!gate.enabled);
    }
}
