//! Bearer token verification against the cached key set.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{AuthError, KeySetCache};
use crate::config::OAuthConfig;
use crate::{Error, Result};

/// Identity extracted from a verified token.
///
/// Lives for one request only; never cached across requests.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedIdentity {
    /// `sub` claim
    pub subject: String,
    /// Scopes from the space-delimited `scope` claim, in token order, deduplicated
    pub scopes: Vec<String>,
    /// All claims as decoded
    pub claims: Map<String, Value>,
    /// `exp` claim (Unix seconds)
    pub expires_at: i64,
}

impl VerifiedIdentity {
    /// Whether the token carries `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Header and claims read without signature verification.
///
/// Diagnostics only. Never base an authorization decision on this.
#[derive(Debug, Clone, Serialize)]
pub struct UnverifiedTokenInfo {
    /// Decoded JOSE header
    pub header: Value,
    /// Decoded claims
    pub claims: Value,
    /// `exp` claim, if numeric
    pub expires_at: Option<i64>,
    /// `iat` claim, if numeric
    pub issued_at: Option<i64>,
}

/// Verifies JWTs issued for one audience by one issuer.
pub struct TokenVerifier {
    keys: Arc<KeySetCache>,
    audience: String,
    issuer: String,
    algorithms: Vec<Algorithm>,
    leeway_secs: u64,
}

impl TokenVerifier {
    /// Create a verifier accepting RS256 only.
    #[must_use]
    pub fn new(keys: Arc<KeySetCache>, audience: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            keys,
            audience: audience.into(),
            issuer: issuer.into(),
            algorithms: vec![Algorithm::RS256],
            leeway_secs: 0,
        }
    }

    /// Build a verifier (and its key set cache) from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JWKS URL, audience or issuer is
    /// missing, or an algorithm name is not recognized.
    pub fn from_config(config: &OAuthConfig) -> Result<Self> {
        let jwks_url = config
            .jwks_url
            .clone()
            .ok_or_else(|| Error::Config("oauth.jwks_url is required".to_string()))?;
        let audience = config
            .audience
            .clone()
            .ok_or_else(|| Error::Config("oauth.audience is required".to_string()))?;
        let issuer = config
            .issuer
            .clone()
            .ok_or_else(|| Error::Config("oauth.issuer is required".to_string()))?;

        let keys = Arc::new(KeySetCache::new(jwks_url, config.jwks_timeout));
        info!(audience = %audience, issuer = %issuer, "JWT verifier initialized");

        Ok(Self::new(keys, audience, issuer)
            .with_algorithms(config.parsed_algorithms()?)
            .with_leeway(config.leeway_secs))
    }

    /// Replace the algorithm allow-list.
    #[must_use]
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Clock-skew tolerance applied to `exp`.
    #[must_use]
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = secs;
        self
    }

    /// The signing key cache this verifier resolves keys through.
    #[must_use]
    pub fn key_set(&self) -> &Arc<KeySetCache> {
        &self.keys
    }

    /// Verify `token` and extract the caller's identity.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidToken`]: malformed header, no `kid`, algorithm not
    ///   allowed, key not found after one refresh, or bad signature
    /// - [`AuthError::TokenExpired`]: valid signature, `exp` in the past
    /// - [`AuthError::ClaimsInvalid`]: audience, issuer or a required claim mismatch
    /// - [`AuthError::KeySetUnavailable`]: the JWKS refresh failed
    pub async fn validate(&self, token: &str) -> std::result::Result<VerifiedIdentity, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("Invalid JWT token header: {e}")))?;

        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::InvalidToken("Token header missing 'kid' (key ID)".to_string()))?;

        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "Signing algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let key = self.keys.get_key(kid).await?.ok_or_else(|| {
            warn!(kid = %kid, "Signing key not found after key set refresh");
            AuthError::InvalidToken(format!("Signing key with kid '{kid}' not found in JWKS"))
        })?;

        if key.algorithm.is_some_and(|alg| alg != header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "Token algorithm {:?} does not match signing key '{kid}'",
                header.alg
            )));
        }

        let validation = self.validation(header.alg);
        let data = jsonwebtoken::decode::<Map<String, Value>>(token, key.decoding_key(), &validation)
            .map_err(classify)?;
        let claims = data.claims;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::ClaimsInvalid("'sub' claim must be a string".to_string()))?
            .to_string();
        let scopes = parse_scopes(claims.get("scope"));
        let expires_at = claims.get("exp").and_then(Value::as_i64).unwrap_or_default();

        debug!(subject = %subject, scopes = ?scopes, expires_at, "Token validated");

        Ok(VerifiedIdentity {
            subject,
            scopes,
            claims,
            expires_at,
        })
    }

    /// Whether every `required` scope is present in `token_scopes`.
    #[must_use]
    pub fn validate_scopes<S: AsRef<str>>(token_scopes: &[String], required: &[S]) -> bool {
        required
            .iter()
            .all(|r| token_scopes.iter().any(|s| s == r.as_ref()))
    }

    /// Read header and claims without verifying the signature.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the token is not three
    /// base64url JSON segments.
    pub fn token_info(token: &str) -> std::result::Result<UnverifiedTokenInfo, AuthError> {
        let mut parts = token.splitn(3, '.');
        let (Some(header), Some(claims), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(AuthError::InvalidToken("Token is not a JWS compact serialization".to_string()));
        };

        let header = decode_segment(header)?;
        let claims = decode_segment(claims)?;
        let expires_at = claims.get("exp").and_then(Value::as_i64);
        let issued_at = claims.get("iat").and_then(Value::as_i64);

        Ok(UnverifiedTokenInfo {
            header,
            claims,
            expires_at,
            issued_at,
        })
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = self.leeway_secs;
        validation.validate_exp = true;
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
        validation
    }
}

/// Map a `jsonwebtoken` failure onto the auth taxonomy.
fn classify(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::InvalidAudience => AuthError::ClaimsInvalid("audience mismatch".to_string()),
        ErrorKind::InvalidIssuer => AuthError::ClaimsInvalid("issuer mismatch".to_string()),
        ErrorKind::ImmatureSignature => AuthError::ClaimsInvalid("token not yet valid".to_string()),
        ErrorKind::MissingRequiredClaim(claim) => {
            AuthError::ClaimsInvalid(format!("missing required claim '{claim}'"))
        }
        _ => AuthError::InvalidToken(format!("Invalid JWT token: {err}")),
    }
}

/// Split a space-delimited `scope` claim, keeping first occurrences in order.
fn parse_scopes(claim: Option<&Value>) -> Vec<String> {
    let Some(raw) = claim.and_then(Value::as_str) else {
        return Vec::new();
    };
    let mut scopes: Vec<String> = Vec::new();
    for scope in raw.split_whitespace() {
        if !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
    }
    scopes
}

fn decode_segment(segment: &str) -> std::result::Result<Value, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::InvalidToken("Token segment is not base64url".to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::InvalidToken("Token segment is not JSON".to_string()))
}
