//! Key set cache: signing keys fetched from a remote JWKS endpoint.
//!
//! The cache starts empty and is filled on demand. A refresh replaces the
//! whole key map (never merges) because the issuer may rotate keys
//! atomically. There is no expiry timer: a `kid` missing from the map is the
//! only staleness signal.
//!
//! Concurrent misses share one fetch. Each caller remembers the refresh
//! generation it observed before its lookup; a caller that finds the
//! generation already advanced once it holds the refresh gate skips its own
//! fetch and retries against the newer map.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, Jwk, KeyAlgorithm},
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::AuthError;

/// Public signing key published by the issuer. Immutable once fetched.
#[derive(Clone)]
pub struct SigningKey {
    /// Key identifier (`kid`)
    pub key_id: String,
    /// Algorithm declared on the JWK, if any
    pub algorithm: Option<Algorithm>,
    key: DecodingKey,
}

impl SigningKey {
    /// Key material ready for signature verification.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

type KeyMap = HashMap<String, Arc<SigningKey>>;

/// JWKS document with each key left raw, so one key the verifier cannot
/// model does not reject the whole set.
#[derive(Debug, Deserialize)]
struct RawKeySet {
    keys: Vec<Value>,
}

/// JWKS-backed signing key cache for a single issuer.
pub struct KeySetCache {
    url: String,
    http: reqwest::Client,
    keys: RwLock<Arc<KeyMap>>,
    /// Bumped after every successful refresh.
    generation: AtomicU64,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl KeySetCache {
    /// Create a cache for `url` with a request timeout.
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self::with_client(url, http)
    }

    /// Create a cache that fetches with the given HTTP client.
    #[must_use]
    pub fn with_client(url: impl Into<String>, http: reqwest::Client) -> Self {
        let url = url.into();
        if !url.starts_with("https://") {
            warn!(url = %url, "JWKS URL is not HTTPS");
        }
        Self {
            url,
            http,
            keys: RwLock::new(Arc::new(HashMap::new())),
            generation: AtomicU64::new(0),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// JWKS endpoint this cache fetches from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether no keys are cached (never fetched, or an empty key set).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Number of successful refreshes so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Look up `key_id`, refreshing the key set once on a miss.
    ///
    /// Returns `Ok(None)` when the key is absent even after the refresh.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetUnavailable`] if the refresh fetch fails.
    pub async fn get_key(&self, key_id: &str) -> Result<Option<Arc<SigningKey>>, AuthError> {
        let seen = self.generation();
        if let Some(key) = self.lookup(key_id) {
            return Ok(Some(key));
        }

        debug!(kid = %key_id, "Key not in cached key set, refreshing");
        self.refresh_after(seen).await?;
        Ok(self.lookup(key_id))
    }

    /// Fetch the key set unconditionally and replace the cache.
    ///
    /// Returns the number of usable keys now cached.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetUnavailable`] on network errors, non-2xx
    /// responses, or malformed bodies. The previous key map is kept.
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let _gate = self.refresh_gate.lock().await;
        self.fetch_and_replace().await
    }

    fn lookup(&self, key_id: &str) -> Option<Arc<SigningKey>> {
        self.keys.read().get(key_id).cloned()
    }

    /// Refresh unless another caller already refreshed since generation `seen`.
    async fn refresh_after(&self, seen: u64) -> Result<(), AuthError> {
        let _gate = self.refresh_gate.lock().await;
        if self.generation() != seen {
            debug!("Key set refreshed concurrently, skipping fetch");
            return Ok(());
        }
        self.fetch_and_replace().await.map(|_| ())
    }

    async fn fetch_and_replace(&self) -> Result<usize, AuthError> {
        debug!(url = %self.url, "Fetching JWKS");
        let jwks = self.fetch().await?;
        let keys = build_key_map(&jwks.keys);
        let count = keys.len();

        *self.keys.write() = Arc::new(keys);
        self.generation.fetch_add(1, Ordering::AcqRel);

        info!(keys = count, "JWKS fetched successfully");
        Ok(count)
    }

    async fn fetch(&self) -> Result<RawKeySet, AuthError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| unavailable(&self.url, &e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = %status, "JWKS endpoint returned an error status");
            return Err(AuthError::KeySetUnavailable(format!(
                "JWKS endpoint returned HTTP {status}"
            )));
        }

        response
            .json::<RawKeySet>()
            .await
            .map_err(|e| unavailable(&self.url, &e))
    }
}

fn unavailable(url: &str, err: &reqwest::Error) -> AuthError {
    warn!(url = %url, error = %err, "Failed to fetch JWKS");
    AuthError::KeySetUnavailable(format!("Could not fetch JWKS: {err}"))
}

/// Convert every usable JWK into a [`SigningKey`], keyed by `kid`.
///
/// Keys that do not parse as a JWK, keys without a `kid`, symmetric keys,
/// and malformed key material are skipped.
fn build_key_map(raw_keys: &[Value]) -> KeyMap {
    let mut keys = HashMap::with_capacity(raw_keys.len());
    for raw in raw_keys {
        let jwk = match Jwk::deserialize(raw) {
            Ok(jwk) => jwk,
            Err(e) => {
                debug!(
                    kid = raw.get("kid").and_then(serde_json::Value::as_str).unwrap_or("-"),
                    error = %e,
                    "Skipping unparseable JWK"
                );
                continue;
            }
        };
        let Some(kid) = jwk.common.key_id.as_deref() else {
            debug!("Skipping JWK without 'kid'");
            continue;
        };
        let Some(key) = decoding_key(&jwk) else {
            debug!(kid = %kid, "Skipping unsupported JWK");
            continue;
        };
        keys.insert(
            kid.to_string(),
            Arc::new(SigningKey {
                key_id: kid.to_string(),
                algorithm: jwk.common.key_algorithm.as_ref().and_then(signing_algorithm),
                key,
            }),
        );
    }
    keys
}

fn decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x).ok(),
        // Shared secrets never come from a public key set
        AlgorithmParameters::OctetKey(_) => None,
    }
}

/// Map a JWK `alg` onto a JWS signing algorithm (encryption algs map to `None`).
fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}
