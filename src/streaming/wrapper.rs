//! Runs a blocking tool on the blocking pool and reports its lifecycle
//! into a stream channel.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::StreamHub;
use crate::tools::{Tool, ToolError};

/// Streaming wrapper around one tool.
#[derive(Clone)]
pub struct StreamingToolWrapper {
    tool: Arc<dyn Tool>,
}

impl StreamingToolWrapper {
    /// Wrap `tool`.
    #[must_use]
    pub fn new(tool: Arc<dyn Tool>) -> Self {
        Self { tool }
    }

    /// Name of the wrapped tool.
    #[must_use]
    pub fn tool_name(&self) -> &str {
        self.tool.name()
    }

    /// Execute the tool, emitting `status: starting`, progress at 10, 50 and
    /// 90 percent, then `complete` on success or a single `error` on failure.
    ///
    /// The failure is also returned so the caller can log it.
    pub async fn execute_with_streaming(
        &self,
        hub: &StreamHub,
        request_id: &str,
        args: Value,
    ) -> Result<Value, ToolError> {
        let started = Instant::now();
        let name = self.tool.name().to_string();

        hub.send_status(
            request_id,
            "starting",
            format!("Starting {name} execution"),
            Some(json!({ "params": args })),
        )
        .await;
        hub.send_progress(request_id, "validation", 10, "Validating input parameters", None)
            .await;
        hub.send_progress(
            request_id,
            "execution",
            50,
            format!("Executing {name} operation"),
            None,
        )
        .await;

        let tool = Arc::clone(&self.tool);
        let outcome = tokio::task::spawn_blocking(move || tool.execute(args))
            .await
            .unwrap_or_else(|e| Err(ToolError::Internal(format!("tool task failed: {e}"))));

        match outcome {
            Ok(result) => {
                hub.send_progress(request_id, "processing", 90, "Processing results", None)
                    .await;
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                hub.send_complete(request_id, result.clone(), duration_ms, true)
                    .await;
                info!(tool = %name, request_id = %request_id, duration_ms, "Streaming execution completed");
                Ok(result)
            }
            Err(err) => {
                warn!(tool = %name, request_id = %request_id, error = %err, "Streaming execution failed");
                hub.send_error(request_id, err.kind(), err.to_string(), Some(err.code()))
                    .await;
                Err(err)
            }
        }
    }
}
