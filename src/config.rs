//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` secrets.
    /// Paths support ~ expansion. Loaded in order; variables already set win.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// OAuth issuer and client configuration
    pub oauth: OAuthConfig,
    /// Auth gate configuration
    pub auth: AuthConfig,
    /// Progress streaming configuration
    pub streaming: StreamingConfig,
    /// Tool configuration
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // TOOLGATE_OAUTH__JWKS_URL -> oauth.jwks_url
        figment = figment.merge(Env::prefixed("TOOLGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when auth is enabled without the issuer
    /// settings, an algorithm is unknown or symmetric, or the stream buffer
    /// is empty.
    pub fn validate(&self) -> Result<()> {
        if self.auth.enabled {
            let missing: Vec<&str> = [
                ("oauth.jwks_url", self.oauth.jwks_url.is_none()),
                ("oauth.issuer", self.oauth.issuer.is_none()),
                ("oauth.audience", self.oauth.audience.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();

            if !missing.is_empty() {
                return Err(Error::Config(format!(
                    "auth is enabled but {} not set",
                    missing.join(", ")
                )));
            }
        }

        self.oauth.parsed_algorithms()?;

        if self.streaming.buffer_size == 0 {
            return Err(Error::Config("streaming.buffer_size must be at least 1".to_string()));
        }

        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Allowed CORS origins (`*` allows any)
    pub cors_origins: Vec<String>,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_string()],
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// OAuth issuer (verification) and client (acquisition) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// JWKS endpoint of the issuer
    pub jwks_url: Option<String>,
    /// Expected `iss` claim
    pub issuer: Option<String>,
    /// Expected `aud` claim, also the audience requested by the acquirer
    pub audience: Option<String>,
    /// Accepted signing algorithms
    pub algorithms: Vec<String>,
    /// Clock-skew tolerance for `exp`, in seconds
    pub leeway_secs: u64,
    /// JWKS fetch timeout
    #[serde(with = "humantime_serde")]
    pub jwks_timeout: Duration,
    /// Token endpoint for the client-credentials grant
    pub token_url: Option<String>,
    /// Client id for the client-credentials grant
    pub client_id: Option<String>,
    /// Client secret. Supports: literal value or `env:VAR_NAME`
    pub client_secret: Option<String>,
    /// Token request timeout
    #[serde(with = "humantime_serde")]
    pub token_timeout: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            jwks_url: None,
            issuer: None,
            audience: None,
            algorithms: vec!["RS256".to_string()],
            leeway_secs: 0,
            jwks_timeout: Duration::from_secs(10),
            token_url: None,
            client_id: None,
            client_secret: None,
            token_timeout: Duration::from_secs(10),
        }
    }
}

impl OAuthConfig {
    /// Parse the algorithm allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown name, a symmetric (HS*)
    /// algorithm, or an empty list.
    pub fn parsed_algorithms(&self) -> Result<Vec<Algorithm>> {
        if self.algorithms.is_empty() {
            return Err(Error::Config("oauth.algorithms must not be empty".to_string()));
        }
        self.algorithms
            .iter()
            .map(|name| {
                let alg: Algorithm = name
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("Unknown signing algorithm: {name}")))?;
                match alg {
                    Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Err(Error::Config(
                        format!("Symmetric algorithm {name} cannot be verified with a JWKS"),
                    )),
                    _ => Ok(alg),
                }
            })
            .collect()
    }

    /// Resolve the client secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        resolve_secret(self.client_secret.as_deref())
    }
}

/// Expand `env:VAR_NAME` to the variable's value; literals pass through.
///
/// An unset variable leaves the reference itself in place.
fn resolve_secret(secret: Option<&str>) -> Option<String> {
    secret.map(|secret| {
        if let Some(var_name) = secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| secret.to_string())
        } else {
            secret.to_string()
        }
    })
}

/// Auth gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a verified bearer token on non-exempt paths
    pub enabled: bool,
    /// Paths that bypass authentication (exact match)
    pub exempt_paths: Vec<String>,
    /// Routes under this prefix may carry the token as a query parameter
    pub stream_prefix: String,
    /// Query parameter holding the token on stream routes
    pub token_query_param: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exempt_paths: ["/", "/health", "/get-token", "/test"]
                .into_iter()
                .map(String::from)
                .collect(),
            stream_prefix: "/stream/".to_string(),
            token_query_param: "token".to_string(),
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Expose `/stream/{tool}` routes
    pub enabled: bool,
    /// Events buffered per stream before the producer waits
    pub buffer_size: usize,
    /// Idle time before a keepalive frame
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// Enforce per-tool required scopes on stream routes too
    pub enforce_tool_scopes: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 100,
            keepalive_interval: Duration::from_secs(30),
            enforce_tool_scopes: false,
        }
    }
}

/// Tool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// `file_operations` tool
    pub file_operations: FileOperationsConfig,
    /// `weather` tool
    pub weather: WeatherConfig,
}

/// `file_operations` tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOperationsConfig {
    /// Register the tool
    pub enabled: bool,
    /// Directories reads and writes must stay within
    pub allowed_directories: Vec<PathBuf>,
    /// Largest file read or written, in bytes
    pub max_file_size_bytes: u64,
    /// Accepted extensions, with leading dot
    pub allowed_extensions: Vec<String>,
    /// Scopes a caller must hold
    pub required_scopes: Vec<String>,
}

impl Default for FileOperationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_directories: vec![PathBuf::from("./data")],
            max_file_size_bytes: 10 * 1024 * 1024, // 10MB
            allowed_extensions: [".txt", ".json", ".csv", ".md"]
                .into_iter()
                .map(String::from)
                .collect(),
            required_scopes: Vec::new(),
        }
    }
}

/// `weather` tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Register the tool (also requires an API key)
    pub enabled: bool,
    /// OpenWeatherMap API key. Supports: literal value or `env:VAR_NAME`
    pub api_key: Option<String>,
    /// API base URL, without the `/weather` path
    pub base_url: String,
    /// Upstream request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Scopes a caller must hold
    pub required_scopes: Vec<String>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://api.openweathermap.org/data/2.5".to_string(),
            timeout: Duration::from_secs(10),
            required_scopes: Vec::new(),
        }
    }
}

impl WeatherConfig {
    /// Resolve the API key (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret(self.api_key.as_deref()).filter(|key| !key.is_empty())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" before "s", or "100ms" would parse as "100m" + "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
