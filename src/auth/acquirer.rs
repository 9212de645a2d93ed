//! Client-credentials access token acquisition.
//!
//! Used by test and integration flows (`GET /get-token`, `toolgate token`),
//! never on the request path of the auth gate.

use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::AuthError;
use crate::config::OAuthConfig;
use crate::{Error, Result};

/// A cached token is reused only while more than this many seconds remain.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Access token plus its absolute expiry (Unix seconds).
#[derive(Debug, Clone)]
pub struct CachedAccessToken {
    /// The bearer token
    pub access_token: String,
    /// Absolute expiry
    pub expires_at: i64,
}

impl CachedAccessToken {
    /// Whether the token may still be handed out at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: i64) -> bool {
        now < self.expires_at - EXPIRY_MARGIN_SECS
    }
}

/// Snapshot of the acquirer's cache.
#[derive(Debug, Clone, Serialize)]
pub struct TokenCacheInfo {
    /// A token is cached
    pub cached: bool,
    /// The cached token would be reused right now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    /// Absolute expiry of the cached token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Seconds until the cached token's real expiry (may be negative)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_expiry: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
    audience: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Obtains and caches one client-credentials access token.
pub struct TokenAcquirer {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    audience: String,
    timeout: Duration,
    cached: RwLock<Option<CachedAccessToken>>,
}

impl std::fmt::Debug for TokenAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAcquirer")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl TokenAcquirer {
    /// Create an acquirer for one client against one token endpoint.
    #[must_use]
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        audience: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let http = Client::builder().timeout(timeout).build().unwrap_or_default();
        let audience = audience.into();
        info!(audience = %audience, "Token acquirer initialized");
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            audience,
            timeout,
            cached: RwLock::new(None),
        }
    }

    /// Build an acquirer from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the token URL, client id, client secret
    /// or audience is missing.
    pub fn from_config(config: &OAuthConfig) -> Result<Self> {
        let require = |value: Option<String>, name: &str| {
            value.ok_or_else(|| Error::Config(format!("oauth.{name} is required for token acquisition")))
        };
        Ok(Self::new(
            require(config.token_url.clone(), "token_url")?,
            require(config.client_id.clone(), "client_id")?,
            require(config.resolve_client_secret(), "client_secret")?,
            require(config.audience.clone(), "audience")?,
            config.token_timeout,
        ))
    }

    /// Return a valid access token, fetching a new one if needed.
    ///
    /// The cached token is reused while more than [`EXPIRY_MARGIN_SECS`]
    /// remain; `force_refresh` bypasses the cache.
    ///
    /// # Errors
    ///
    /// - [`AuthError::AcquisitionFailed`]: non-200 response, unreadable body,
    ///   or connection failure
    /// - [`AuthError::RequestTimeout`]: the endpoint did not answer in time
    pub async fn get_token(&self, force_refresh: bool) -> std::result::Result<String, AuthError> {
        if !force_refresh {
            if let Some(token) = self.cached_valid(Utc::now().timestamp()) {
                debug!("Using cached access token");
                return Ok(token);
            }
        }

        info!(token_url = %self.token_url, "Fetching new access token");
        let fetched = self.fetch().await?;
        let token = fetched.access_token.clone();
        *self.cached.write() = Some(fetched);
        Ok(token)
    }

    /// Drop the cached token.
    pub fn clear_cache(&self) {
        *self.cached.write() = None;
        debug!("Token cache cleared");
    }

    /// Describe the cached token without fetching.
    #[must_use]
    pub fn token_info(&self) -> TokenCacheInfo {
        let now = Utc::now().timestamp();
        match self.cached.read().as_ref() {
            None => TokenCacheInfo {
                cached: false,
                valid: None,
                expires_at: None,
                seconds_until_expiry: None,
            },
            Some(token) => TokenCacheInfo {
                cached: true,
                valid: Some(token.is_valid_at(now)),
                expires_at: Some(token.expires_at),
                seconds_until_expiry: Some(token.expires_at - now),
            },
        }
    }

    fn cached_valid(&self, now: i64) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .filter(|t| t.is_valid_at(now))
            .map(|t| t.access_token.clone())
    }

    async fn fetch(&self) -> std::result::Result<CachedAccessToken, AuthError> {
        let request = TokenRequest {
            grant_type: "client_credentials",
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            audience: &self.audience,
        };

        let response = self
            .http
            .post(&self.token_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        match status {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                error!("Token endpoint rejected client credentials");
                return Err(AuthError::AcquisitionFailed(
                    "Invalid client credentials".to_string(),
                ));
            }
            StatusCode::FORBIDDEN => {
                error!("Client not authorized for the requested audience");
                return Err(AuthError::AcquisitionFailed(
                    "Client not authorized to access this API".to_string(),
                ));
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, "Token request failed");
                return Err(AuthError::AcquisitionFailed(format!(
                    "Failed to obtain access token: {} - {}",
                    status.as_u16(),
                    body
                )));
            }
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(&e))?;
        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        info!(expires_in, "Access token obtained");
        Ok(CachedAccessToken {
            access_token: body.access_token,
            expires_at: Utc::now().timestamp() + expires_in,
        })
    }

    fn transport_error(&self, err: &reqwest::Error) -> AuthError {
        if err.is_timeout() {
            error!(timeout_secs = self.timeout.as_secs(), "Token request timed out");
            AuthError::RequestTimeout(self.timeout)
        } else {
            error!(error = %err, "Token request failed");
            AuthError::AcquisitionFailed(format!("Failed to reach token endpoint: {err}"))
        }
    }
}
