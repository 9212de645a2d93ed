//! HTTP router and handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response, Sse},
    routing::{get, post},
};
use serde_json::{Map, Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{AuthGate, auth_middleware, rejection_response};
use crate::auth::{TokenAcquirer, VerifiedIdentity, require_scopes};
use crate::config::StreamingConfig;
use crate::streaming::{StreamHub, StreamingToolWrapper};
use crate::tools::{ToolError, ToolRegistry};
use toolgate_core::StreamEvent;

/// Shared application state
pub struct AppState {
    /// Auth gate (verifier and exemptions)
    pub auth_gate: Arc<AuthGate>,
    /// Client-credentials acquirer backing `GET /get-token`
    pub acquirer: Option<Arc<TokenAcquirer>>,
    /// Stream channel table
    pub hub: StreamHub,
    /// Registered tools
    pub tools: Arc<ToolRegistry>,
    /// Streaming configuration
    pub streaming_config: StreamingConfig,
    /// Allowed CORS origins
    pub cors_origins: Vec<String>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_gate = Arc::clone(&state.auth_gate);
    let cors = cors_layer(&state.cors_origins);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/get-token", get(get_token_handler))
        .route("/whoami", get(whoami_handler))
        .route("/test", get(test_page_handler))
        .route("/tools/{name}", post(tool_handler))
        .route("/stream/{name}", get(stream_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(auth_gate, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// GET / - service descriptor
async fn root_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "service": "toolgate",
        "version": env!("CARGO_PKG_VERSION"),
        "authentication": if state.auth_gate.enabled { "OAuth 2.0" } else { "Disabled" },
        "features": ["sse_streaming", "real_time_progress"],
        "endpoints": {
            "/health": "Health check",
            "/get-token": "Obtain a client-credentials token (testing)",
            "/whoami": "Verified identity of the caller",
            "/test": "Browser page for trying streamed tool calls",
            "/tools/{name}": "Invoke a tool (POST, JSON arguments)",
            "/stream/{name}": "Invoke a tool with streamed progress (GET, query arguments)",
        }
    }))
}

/// GET /test - static page that drives `/stream/{name}` from a browser
async fn test_page_handler() -> Html<&'static str> {
    Html(TEST_PAGE)
}

const TEST_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>toolgate stream test</title></head>
<body>
<h1>toolgate stream test</h1>
<p>Get a token from <a href="/get-token">/get-token</a>, then start a stream.</p>
<label>Token <input id="token" size="60"></label><br>
<label>Tool <input id="tool" value="file_operations"></label><br>
<label>Arguments (query string) <input id="args" size="60" value="operation=read&amp;filepath=./data/sample.txt"></label><br>
<button onclick="start()">Start stream</button>
<pre id="log"></pre>
<script>
function start() {
  const log = document.getElementById("log");
  log.textContent = "";
  const tool = encodeURIComponent(document.getElementById("tool").value);
  const token = encodeURIComponent(document.getElementById("token").value);
  const source = new EventSource(`/stream/${tool}?${document.getElementById("args").value}&token=${token}`);
  for (const kind of ["start", "status", "progress", "error", "complete"]) {
    source.addEventListener(kind, (e) => {
      log.textContent += `${kind}: ${e.data}
`;
      if (kind === "error" || kind === "complete") source.close();
    });
  }
  source.onerror = () => { log.textContent += "connection closed
"; source.close(); };
}
</script>
</body>
</html>
"#;

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tools: Map<String, Value> = state
        .tools
        .names()
        .map(|name| (name.to_string(), Value::Bool(true)))
        .collect();

    Json(json!({
        "status": "healthy",
        "auth_enabled": state.auth_gate.enabled,
        "streaming_enabled": state.streaming_config.enabled,
        "active_streams": state.hub.len(),
        "tools": tools,
    }))
}

/// GET /get-token - client-credentials token for test flows
async fn get_token_handler(State(state): State<Arc<AppState>>) -> Response {
    let unavailable = |message: &str| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "token_acquisition_failed",
                "message": message,
                "details": "Check the token endpoint configuration and server logs",
            })),
        )
            .into_response()
    };

    let Some(acquirer) = state.acquirer.as_ref() else {
        return unavailable("Token acquisition is not configured");
    };

    match acquirer.get_token(false).await {
        Ok(access_token) => {
            let info = acquirer.token_info();
            Json(json!({
                "access_token": access_token,
                "token_type": "Bearer",
                "expires_in": info.seconds_until_expiry,
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "Token acquisition failed");
            unavailable("Unable to obtain access token")
        }
    }
}

/// GET /whoami
async fn whoami_handler(identity: Option<Extension<VerifiedIdentity>>) -> impl IntoResponse {
    match identity {
        Some(Extension(identity)) => Json(json!({
            "authenticated": true,
            "subject": identity.subject,
            "scopes": identity.scopes,
            "expires_at": identity.expires_at,
        })),
        None => Json(json!({ "authenticated": false })),
    }
}

/// POST /tools/{name} - synchronous invocation
async fn tool_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    identity: Option<Extension<VerifiedIdentity>>,
    Json(args): Json<Value>,
) -> Response {
    let Some(entry) = state.tools.get(&name) else {
        return tool_not_found(&name);
    };

    if let Some(Extension(ref identity)) = identity {
        if let Err(e) = require_scopes(identity, &entry.required_scopes) {
            return rejection_response(&e);
        }
    }

    let tool = Arc::clone(&entry.tool);
    let outcome = tokio::task::spawn_blocking(move || tool.execute(args))
        .await
        .unwrap_or_else(|e| Err(ToolError::Internal(format!("tool task failed: {e}"))));

    match outcome {
        Ok(result) => Json(json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": null,
        }))
        .into_response(),
        Err(err) => {
            warn!(tool = %name, error = %err, "Tool invocation failed");
            tool_error_response(&err)
        }
    }
}

/// GET /stream/{name}?<args>&token=<jwt> - invocation with streamed progress
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    identity: Option<Extension<VerifiedIdentity>>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Response {
    if !state.streaming_config.enabled {
        debug!(tool = %name, "Stream requested while streaming is disabled");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "streaming_disabled",
                "message": "Streaming is disabled on this server",
            })),
        )
            .into_response();
    }

    params.remove(state.auth_gate.token_query_param());
    let args = Value::Object(
        params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );

    let entry = state.tools.get(&name).cloned();
    if let (Some(entry), Some(Extension(identity))) = (&entry, &identity) {
        if state.streaming_config.enforce_tool_scopes {
            if let Err(e) = require_scopes(identity, &entry.required_scopes) {
                return rejection_response(&e);
            }
        }
    }

    let request_id = Uuid::new_v4().to_string();
    let subject = identity.map_or_else(|| "anonymous".to_string(), |Extension(i)| i.subject);
    info!(tool = %name, subject = %subject, request_id = %request_id, "Streaming tool execution");

    // The channel must exist before the producer starts
    let receiver = state.hub.create(request_id.clone());
    let hub = state.hub.clone();

    tokio::spawn(async move {
        let Some(entry) = entry else {
            hub.send_error(
                &request_id,
                "ToolNotAvailable",
                format!("Tool '{name}' is not available"),
                None,
            )
            .await;
            return;
        };

        hub.send_event(&request_id, StreamEvent::start(&name, args.clone()))
            .await;
        let wrapper = StreamingToolWrapper::new(entry.tool);
        if let Err(e) = wrapper.execute_with_streaming(&hub, &request_id, args).await {
            warn!(tool = %name, request_id = %request_id, error = %e, "Streamed tool failed");
        }
    });

    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(receiver.into_sse_stream()),
    )
        .into_response()
}

fn tool_not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": -32601,
                "message": format!("Tool not found: {name}"),
            },
            "id": null,
        })),
    )
        .into_response()
}

/// HTTP status for a tool failure
fn tool_error_status(err: &ToolError) -> StatusCode {
    match err {
        ToolError::InvalidParams(_)
        | ToolError::InvalidExtension(_)
        | ToolError::InvalidCity(_) => StatusCode::BAD_REQUEST,
        ToolError::PathNotAllowed(_) | ToolError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        ToolError::FileNotFound(_) | ToolError::CityNotFound(_) => StatusCode::NOT_FOUND,
        ToolError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ToolError::ApiTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ToolError::ApiRateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
        ToolError::ApiAuthentication(_) | ToolError::Network(_) => StatusCode::BAD_GATEWAY,
        ToolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn tool_error_response(err: &ToolError) -> Response {
    let message = match err {
        ToolError::Internal(_) => "Internal error".to_string(),
        _ => err.to_string(),
    };
    (
        tool_error_status(err),
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": err.code(),
                "message": message,
                "data": { "type": err.kind() },
            },
            "id": null,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_errors_map_to_http_statuses() {
        assert_eq!(
            tool_error_status(&ToolError::FileNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            tool_error_status(&ToolError::FileTooLarge { size: 2, max: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            tool_error_status(&ToolError::PathNotAllowed("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            tool_error_status(&ToolError::InvalidExtension("x".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn wildcard_cors_origin_builds() {
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&["http://localhost:3000".to_string(), "not a header\n".to_string()]);
    }
}
