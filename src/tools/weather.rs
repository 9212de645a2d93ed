//! `weather` tool: current conditions for a city from OpenWeatherMap.
//!
//! Tools run on the blocking pool, so the HTTP call is driven with the
//! ambient runtime's `Handle::block_on`.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::{Client, StatusCode, Url, header::RETRY_AFTER};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{Tool, ToolError, str_arg};
use crate::config::WeatherConfig;

const SERVICE: &str = "OpenWeatherMap";

const MIN_CITY_CHARS: usize = 2;
const MAX_CITY_CHARS: usize = 100;

/// Substrings rejected anywhere in a lowercased city name.
const FORBIDDEN_PATTERNS: &[&str] = &[
    "--", ";", "/*", "*/", "xp_", "sp_", "exec", "drop", "delete",
];

/// Check a city name and return it trimmed.
///
/// # Errors
///
/// [`ToolError::InvalidCity`] when the name is empty, shorter than 2 or
/// longer than 100 characters, contains characters other than letters,
/// digits, whitespace, `-`, `'` and `_`, or contains a forbidden pattern.
pub fn validate_city(city: &str) -> Result<&str, ToolError> {
    let city = city.trim();
    if city.is_empty() {
        return Err(ToolError::InvalidCity("city name cannot be empty".into()));
    }

    let chars = city.chars().count();
    if chars < MIN_CITY_CHARS {
        return Err(ToolError::InvalidCity(format!(
            "city name too short (min {MIN_CITY_CHARS} characters)"
        )));
    }
    if chars > MAX_CITY_CHARS {
        return Err(ToolError::InvalidCity(format!(
            "city name too long (max {MAX_CITY_CHARS} characters)"
        )));
    }

    if !city
        .chars()
        .all(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '\'' | '_'))
    {
        return Err(ToolError::InvalidCity(
            "city name contains invalid characters".into(),
        ));
    }

    let lower = city.to_lowercase();
    if FORBIDDEN_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Err(ToolError::InvalidCity(
            "city name contains invalid characters".into(),
        ));
    }

    Ok(city)
}

/// Current weather lookups against the OpenWeatherMap `weather` endpoint.
pub struct WeatherTool {
    http: Client,
    api_key: String,
    endpoint: String,
    timeout: Duration,
}

impl std::fmt::Debug for WeatherTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherTool")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WeatherTool {
    /// Create a tool calling `{base_url}/weather`.
    #[must_use]
    pub fn new(api_key: impl Into<String>, base_url: &str, timeout: Duration) -> Self {
        let http = Client::builder().timeout(timeout).build().unwrap_or_default();
        let endpoint = format!("{}/weather", base_url.trim_end_matches('/'));
        info!(endpoint = %endpoint, timeout_secs = timeout.as_secs(), "Weather tool initialized");
        Self {
            http,
            api_key: api_key.into(),
            endpoint,
            timeout,
        }
    }

    /// Build the tool from configuration; `None` when no API key resolves.
    #[must_use]
    pub fn from_config(config: &WeatherConfig) -> Option<Self> {
        let api_key = config.resolve_api_key()?;
        Some(Self::new(api_key, &config.base_url, config.timeout))
    }

    /// Fetch and shape current conditions for an already validated city.
    ///
    /// # Errors
    ///
    /// - [`ToolError::CityNotFound`]: upstream 404
    /// - [`ToolError::ApiAuthentication`]: upstream 401
    /// - [`ToolError::ApiRateLimit`]: upstream 429, with `Retry-After` if sent
    /// - [`ToolError::ApiTimeout`]: no answer within the configured timeout
    /// - [`ToolError::Network`]: any other status, unreadable body, or
    ///   connection failure
    pub async fn current(&self, city: &str) -> Result<Value, ToolError> {
        let url = Url::parse_with_params(
            &self.endpoint,
            [("q", city), ("appid", self.api_key.as_str()), ("units", "metric")],
        )
        .map_err(|e| ToolError::Internal(format!("invalid weather endpoint: {e}")))?;

        let started = Instant::now();
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        debug!(
            service = SERVICE,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Weather API call completed"
        );

        match status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(ToolError::CityNotFound(city.to_string())),
            StatusCode::UNAUTHORIZED => {
                warn!(service = SERVICE, "Weather API rejected the API key");
                return Err(ToolError::ApiAuthentication(SERVICE.to_string()));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                warn!(service = SERVICE, retry_after = ?retry_after, "Weather API rate limited");
                return Err(ToolError::ApiRateLimit {
                    service: SERVICE.to_string(),
                    retry_after,
                });
            }
            _ => {
                warn!(service = SERVICE, status = %status, "Weather API error");
                return Err(ToolError::Network(format!(
                    "{SERVICE} API error: {}",
                    status.as_u16()
                )));
            }
        }

        let data: Value = response.json().await.map_err(|e| self.transport_error(e))?;
        let result = shape_response(&data, city)?;
        info!(city = %city, "Weather data retrieved");
        Ok(result)
    }

    fn transport_error(&self, err: reqwest::Error) -> ToolError {
        // The URL carries the API key
        let err = err.without_url();
        if err.is_timeout() {
            warn!(service = SERVICE, "Weather API request timed out");
            ToolError::ApiTimeout {
                service: SERVICE.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else if err.is_decode() {
            ToolError::Network(format!("unreadable {SERVICE} response: {err}"))
        } else {
            warn!(service = SERVICE, error = %err, "Weather API request failed");
            ToolError::Network(format!("connection error: {err}"))
        }
    }
}

fn round1(value: &Value) -> f64 {
    value.as_f64().map_or(0.0, |v| (v * 10.0).round() / 10.0)
}

fn shape_response(data: &Value, requested: &str) -> Result<Value, ToolError> {
    if !data.is_object() {
        return Err(ToolError::Network(format!(
            "{SERVICE} response is not a JSON object"
        )));
    }
    let main = &data["main"];
    let conditions = &data["weather"][0];

    let mut result = json!({
        "city": data["name"].as_str().unwrap_or(requested),
        "country": data["sys"]["country"].as_str().unwrap_or("Unknown"),
        "temperature_celsius": round1(&main["temp"]),
        "feels_like_celsius": round1(&main["feels_like"]),
        "humidity_percent": main["humidity"].as_i64().unwrap_or(0),
        "description": conditions["description"].as_str().unwrap_or(""),
        "weather_main": conditions["main"].as_str().unwrap_or(""),
        "wind_speed_ms": round1(&data["wind"]["speed"]),
        "pressure_hpa": main["pressure"].as_i64().unwrap_or(0),
        "timestamp": Utc::now().to_rfc3339(),
        "api_timestamp": data["dt"].as_i64().unwrap_or(0),
    });
    if let Some(clouds) = data.get("clouds") {
        result["cloudiness_percent"] = json!(clouds["all"].as_i64().unwrap_or(0));
    }
    if let Some(visibility) = data.get("visibility").and_then(Value::as_i64) {
        result["visibility_meters"] = json!(visibility);
    }
    Ok(result)
}

impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "Current weather conditions for a city"
    }

    /// Must run off the async workers (the router and the streaming wrapper
    /// use `spawn_blocking`).
    fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let city = validate_city(str_arg(&args, "city")?)?;
        let handle = Handle::try_current()
            .map_err(|_| ToolError::Internal("weather lookups need a Tokio runtime".into()))?;
        handle.block_on(self.current(city))
    }
}
