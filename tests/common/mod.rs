//! Shared fixtures: per-test signing keys and throwaway issuer endpoints.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use toolgate::auth::{KeySetCache, TokenVerifier};

pub const ISSUER: &str = "https://issuer.test/";
pub const AUDIENCE: &str = "https://api.test";

/// A P-256 signing key and its public JWK.
pub struct TestKey {
    pub kid: String,
    encoding: EncodingKey,
    pub jwk: Value,
}

impl TestKey {
    pub fn generate(kid: &str) -> Self {
        use rcgen::PublicKeyData as _;

        let key_pair = rcgen::KeyPair::generate().expect("key generation failed");
        let encoding = EncodingKey::from_ec_pem(key_pair.serialize_pem().as_bytes())
            .expect("rcgen emits PKCS#8 PEM");

        // Uncompressed SEC1 point: 0x04 || x || y
        let raw = key_pair.der_bytes();
        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
            "kid": kid,
            "alg": "ES256",
            "use": "sig",
        });

        Self {
            kid: kid.to_string(),
            encoding,
            jwk,
        }
    }

    /// Sign arbitrary claims with this key's `kid` in the header.
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding).expect("signing failed")
    }

    /// Sign standard claims for `sub` with `scope`, valid for an hour.
    pub fn token(&self, sub: &str, scope: &str) -> String {
        self.sign(&claims(sub, scope))
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn claims(sub: &str, scope: &str) -> Value {
    json!({
        "sub": sub,
        "scope": scope,
        "aud": AUDIENCE,
        "iss": ISSUER,
        "iat": now(),
        "exp": now() + 3600,
    })
}

/// JWKS endpoint whose key list can be swapped mid-test.
pub struct JwksServer {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
    keys: Arc<RwLock<Vec<Value>>>,
    body: Arc<RwLock<Option<Value>>>,
    failing: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Clone)]
struct JwksState {
    hits: Arc<AtomicUsize>,
    keys: Arc<RwLock<Vec<Value>>>,
    body: Arc<RwLock<Option<Value>>>,
    failing: Arc<std::sync::atomic::AtomicBool>,
}

impl JwksServer {
    pub async fn start(keys: &[&TestKey]) -> Self {
        let state = JwksState {
            hits: Arc::new(AtomicUsize::new(0)),
            keys: Arc::new(RwLock::new(keys.iter().map(|k| k.jwk.clone()).collect())),
            body: Arc::new(RwLock::new(None)),
            failing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        let app = Router::new()
            .route("/.well-known/jwks.json", get(jwks_handler))
            .with_state(state.clone());
        let url = format!("{}/.well-known/jwks.json", serve(app).await);

        Self {
            url,
            hits: state.hits,
            keys: state.keys,
            body: state.body,
            failing: state.failing,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn publish(&self, keys: &[&TestKey]) {
        *self.keys.write() = keys.iter().map(|k| k.jwk.clone()).collect();
    }

    /// Publish arbitrary JWK objects, including ones no verifier can use.
    pub fn publish_raw(&self, keys: Vec<Value>) {
        *self.keys.write() = keys;
    }

    /// Answer with `body` verbatim instead of a key set.
    pub fn serve_body(&self, body: Value) {
        *self.body.write() = Some(body);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn verifier(&self) -> TokenVerifier {
        let cache = Arc::new(KeySetCache::new(self.url.clone(), Duration::from_secs(5)));
        TokenVerifier::new(cache, AUDIENCE, ISSUER).with_algorithms(vec![Algorithm::ES256])
    }
}

async fn jwks_handler(State(state): State<JwksState>) -> Result<Json<Value>, StatusCode> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.failing.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if let Some(body) = state.body.read().clone() {
        return Ok(Json(body));
    }
    Ok(Json(json!({ "keys": *state.keys.read() })))
}

/// How the fake token endpoint answers.
#[derive(Clone)]
pub enum TokenBehavior {
    /// 200 with a fresh token each call and this `expires_in` (None omits it)
    Issue(Option<i64>),
    /// Reply with this status
    Status(StatusCode),
    /// Sleep before answering
    Slow(Duration),
}

pub struct TokenServer {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
    pub last_body: Arc<RwLock<Option<Value>>>,
}

#[derive(Clone)]
struct TokenState {
    hits: Arc<AtomicUsize>,
    last_body: Arc<RwLock<Option<Value>>>,
    behavior: TokenBehavior,
}

impl TokenServer {
    pub async fn start(behavior: TokenBehavior) -> Self {
        let state = TokenState {
            hits: Arc::new(AtomicUsize::new(0)),
            last_body: Arc::new(RwLock::new(None)),
            behavior,
        };
        let app = Router::new()
            .route("/oauth/token", post(token_handler))
            .with_state(state.clone());
        let url = format!("{}/oauth/token", serve(app).await);

        Self {
            url,
            hits: state.hits,
            last_body: state.last_body,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn token_handler(
    State(state): State<TokenState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let n = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_body.write() = Some(body);

    match state.behavior {
        TokenBehavior::Issue(expires_in) => {
            let mut response = json!({
                "access_token": format!("access-token-{n}"),
                "token_type": "Bearer",
            });
            if let Some(expires_in) = expires_in {
                response["expires_in"] = json!(expires_in);
            }
            Ok(Json(response))
        }
        TokenBehavior::Status(status) => Err(status),
        TokenBehavior::Slow(delay) => {
            tokio::time::sleep(delay).await;
            Ok(Json(json!({ "access_token": "late", "expires_in": 3600 })))
        }
    }
}

/// How the fake weather endpoint answers.
#[derive(Clone)]
pub enum WeatherBehavior {
    /// 200 with a fixed payload naming the queried city
    Report,
    /// Reply with this status and optional `Retry-After` seconds
    Status(StatusCode, Option<u64>),
    /// Sleep before answering
    Slow(Duration),
}

pub struct WeatherServer {
    /// Base URL, without `/weather`
    pub url: String,
    pub hits: Arc<AtomicUsize>,
    pub last_query: Arc<RwLock<Option<HashMap<String, String>>>>,
}

#[derive(Clone)]
struct WeatherState {
    hits: Arc<AtomicUsize>,
    last_query: Arc<RwLock<Option<HashMap<String, String>>>>,
    behavior: WeatherBehavior,
}

impl WeatherServer {
    pub async fn start(behavior: WeatherBehavior) -> Self {
        let state = WeatherState {
            hits: Arc::new(AtomicUsize::new(0)),
            last_query: Arc::new(RwLock::new(None)),
            behavior,
        };
        let app = Router::new()
            .route("/weather", get(weather_handler))
            .with_state(state.clone());

        Self {
            url: serve(app).await,
            hits: state.hits,
            last_query: state.last_query,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn weather_handler(
    State(state): State<WeatherState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let city = query.get("q").cloned().unwrap_or_default();
    *state.last_query.write() = Some(query);

    match state.behavior {
        WeatherBehavior::Report => Json(json!({
            "name": city,
            "sys": { "country": "GB" },
            "main": { "temp": 11.26, "feels_like": 10.04, "humidity": 81, "pressure": 1009 },
            "weather": [{ "main": "Clouds", "description": "overcast clouds" }],
            "wind": { "speed": 5.14 },
            "clouds": { "all": 100 },
            "visibility": 10000,
            "dt": 1_760_000_000,
        }))
        .into_response(),
        WeatherBehavior::Status(status, retry_after) => match retry_after {
            Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())]).into_response(),
            None => status.into_response(),
        },
        WeatherBehavior::Slow(delay) => {
            tokio::time::sleep(delay).await;
            Json(json!({ "name": city })).into_response()
        }
    }
}

/// Serve `app` on an ephemeral port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server failed");
    });
    format!("http://{addr}")
}
