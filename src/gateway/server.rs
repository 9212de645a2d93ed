//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::auth::AuthGate;
use super::router::{AppState, create_router};
use crate::auth::{TokenAcquirer, TokenVerifier};
use crate::config::Config;
use crate::streaming::StreamHub;
use crate::tools::{FileOperationsTool, ToolRegistry, WeatherTool};
use crate::{Error, Result};

/// toolgate server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Gateway {
    /// Build the server state from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if auth is enabled but the verifier cannot
    /// be built.
    pub fn new(config: Config) -> Result<Self> {
        let verifier = if config.auth.enabled {
            Some(Arc::new(TokenVerifier::from_config(&config.oauth)?))
        } else {
            None
        };
        let auth_gate = Arc::new(AuthGate::new(&config.auth, verifier));

        let acquirer = match TokenAcquirer::from_config(&config.oauth) {
            Ok(a) => Some(Arc::new(a)),
            Err(e) => {
                info!(reason = %e, "Token acquisition disabled");
                None
            }
        };

        let mut tools = ToolRegistry::new();
        let file_ops = &config.tools.file_operations;
        if file_ops.enabled {
            tools.register(
                Arc::new(FileOperationsTool::from_config(file_ops)),
                file_ops.required_scopes.clone(),
            );
        }
        let weather = &config.tools.weather;
        if weather.enabled {
            match WeatherTool::from_config(weather) {
                Some(tool) => tools.register(Arc::new(tool), weather.required_scopes.clone()),
                None => info!("Weather tool disabled: no API key configured"),
            }
        }

        let state = Arc::new(AppState {
            auth_gate,
            acquirer,
            hub: StreamHub::from_config(&config.streaming),
            tools: Arc::new(tools),
            streaming_config: config.streaming.clone(),
            cors_origins: config.server.cors_origins.clone(),
        });

        Ok(Self { config, state })
    }

    /// The HTTP application, without a listener.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the server until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("TOOLGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");

        if self.state.auth_gate.enabled {
            info!(
                issuer = self.config.oauth.issuer.as_deref().unwrap_or_default(),
                audience = self.config.oauth.audience.as_deref().unwrap_or_default(),
                "AUTHENTICATION enabled (OAuth 2.0 bearer tokens)"
            );
        } else {
            warn!("AUTHENTICATION disabled - server is open to all requests");
        }

        for name in self.state.tools.names() {
            info!("  POST /tools/{name}");
            if self.config.streaming.enabled {
                info!("  GET  /stream/{name}  (SSE progress)");
            }
        }
        info!("============================================================");

        serve_with_deadline(
            listener,
            app,
            shutdown_signal(),
            self.config.server.shutdown_timeout,
        )
        .await
    }
}

/// Serve until `signal` fires, then drain in-flight requests for at most
/// `drain_timeout`.
async fn serve_with_deadline<F>(
    listener: TcpListener,
    app: Router,
    signal: F,
    drain_timeout: Duration,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let signal = async move {
        signal.await;
        let _ = drain_tx.send(());
    };

    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
    };
    let deadline = async move {
        if drain_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
        () = deadline => {
            warn!(
                timeout_secs = drain_timeout.as_secs_f64(),
                "Graceful shutdown timed out, dropping open connections"
            );
        }
    }

    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_without_auth() {
        let mut config = Config::default();
        config.auth.enabled = false;

        let gateway = Gateway::new(config).unwrap();

        assert!(!gateway.state.auth_gate.enabled);
        assert!(gateway.state.acquirer.is_none());
        assert!(gateway.state.tools.get("file_operations").is_some());
        assert!(gateway.state.tools.get("weather").is_none());
    }

    #[test]
    fn registers_weather_only_with_api_key() {
        let mut config = Config::default();
        config.auth.enabled = false;
        config.tools.weather.api_key = Some("owm-key".into());
        config.tools.weather.required_scopes = vec!["weather:read".into()];

        let gateway = Gateway::new(config.clone()).unwrap();
        let entry = gateway.state.tools.get("weather").unwrap();
        assert_eq!(entry.required_scopes, vec!["weather:read"]);

        config.tools.weather.enabled = false;
        let gateway = Gateway::new(config).unwrap();
        assert!(gateway.state.tools.get("weather").is_none());
    }

    #[tokio::test]
    async fn shutdown_drops_open_streams_after_deadline() {
        use axum::response::sse::{Event, Sse};
        use axum::routing::get;
        use futures::stream;

        // GIVEN: a server holding one never-ending event stream open
        let app = Router::new().route(
            "/hang",
            get(|| async {
                Sse::new(stream::pending::<std::result::Result<Event, std::convert::Infallible>>())
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_with_deadline(
            listener,
            app,
            async move {
                let _ = stop_rx.await;
            },
            Duration::from_millis(200),
        ));

        let response = reqwest::get(format!("http://{addr}/hang")).await.unwrap();
        assert!(response.status().is_success());

        // WHEN: shutdown is requested while the stream is still open
        stop_tx.send(()).unwrap();

        // THEN: the server returns once the drain deadline passes
        let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(finished.is_ok(), "server kept waiting on the open stream");
        assert!(finished.unwrap().unwrap().is_ok());
        drop(response);
    }

    #[test]
    fn enabled_auth_without_issuer_fails() {
        let result = Gateway::new(Config::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
