//! Tools exposed over HTTP
//!
//! A tool is a synchronous, possibly blocking operation taking a JSON
//! argument object. The registry pairs each tool with the scopes a caller
//! must hold to invoke it.

pub mod file_ops;
pub mod weather;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use file_ops::FileOperationsTool;
pub use weather::WeatherTool;

/// Failure of a tool invocation.
///
/// Codes follow JSON-RPC conventions (`-32602`, `-32603`) plus the
/// application range for file and upstream API errors.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Missing, malformed or contradictory arguments
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Path outside every allowed directory, or a traversal attempt
    #[error("Path not allowed: {0}")]
    PathNotAllowed(String),

    /// Target file does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The OS refused the operation
    #[error("Permission denied: {path} ({operation})")]
    PermissionDenied {
        /// Affected path
        path: String,
        /// Attempted operation
        operation: String,
    },

    /// File or content larger than the configured limit
    #[error("File too large: {size} bytes (max {max} bytes)")]
    FileTooLarge {
        /// Actual size in bytes
        size: u64,
        /// Limit in bytes
        max: u64,
    },

    /// Extension missing or not allow-listed
    #[error("File extension not allowed: {0}")]
    InvalidExtension(String),

    /// City name failed validation
    #[error("Invalid city name: {0}")]
    InvalidCity(String),

    /// Upstream API does not know the city
    #[error("City not found: {0}")]
    CityNotFound(String),

    /// Upstream API did not answer in time
    #[error("{service} did not respond within {timeout_secs}s")]
    ApiTimeout {
        /// Upstream service name
        service: String,
        /// Configured timeout
        timeout_secs: u64,
    },

    /// Upstream API rate limit hit
    #[error("{service} rate limit exceeded")]
    ApiRateLimit {
        /// Upstream service name
        service: String,
        /// `Retry-After` seconds, when the API sent one
        retry_after: Option<u64>,
    },

    /// Upstream API rejected our credentials
    #[error("{0} rejected the configured API key")]
    ApiAuthentication(String),

    /// Connection failure or unexpected upstream response
    #[error("Network error: {0}")]
    Network(String),

    /// Anything else, including a panicked tool
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    /// Stable kind name, reported as `error_type` on the stream.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "InvalidParams",
            Self::PathNotAllowed(_) => "PathNotAllowed",
            Self::FileNotFound(_) => "FileNotFound",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::FileTooLarge { .. } => "FileTooLarge",
            Self::InvalidExtension(_) => "InvalidExtension",
            Self::InvalidCity(_) => "InvalidCity",
            Self::CityNotFound(_) => "CityNotFound",
            Self::ApiTimeout { .. } => "ApiTimeout",
            Self::ApiRateLimit { .. } => "ApiRateLimit",
            Self::ApiAuthentication(_) => "ApiAuthentication",
            Self::Network(_) => "Network",
            Self::Internal(_) => "Internal",
        }
    }

    /// JSON-RPC style error code.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) => -32602,
            Self::PathNotAllowed(_) => -32002,
            Self::FileNotFound(_) => -32003,
            Self::PermissionDenied { .. } => -32004,
            Self::FileTooLarge { .. } => -32005,
            Self::InvalidExtension(_) => -32006,
            Self::InvalidCity(_) => -32008,
            Self::CityNotFound(_) => -32009,
            Self::ApiTimeout { .. } => -32010,
            Self::ApiRateLimit { .. } => -32011,
            Self::ApiAuthentication(_) => -32012,
            Self::Network(_) => -32013,
            Self::Internal(_) => -32603,
        }
    }
}

/// A synchronous tool.
///
/// `execute` may block; callers on the async runtime must run it on a
/// blocking thread.
pub trait Tool: Send + Sync {
    /// Registry name, used in `/tools/{name}` and `/stream/{name}`
    fn name(&self) -> &str;

    /// One-line human description
    fn description(&self) -> &str;

    /// Run the tool with a JSON argument object.
    fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// Required string argument `name` of `args`.
pub(crate) fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParams(format!("missing string argument '{name}'")))
}

/// A tool plus the scopes required to call it.
#[derive(Clone)]
pub struct RegisteredTool {
    /// The tool
    pub tool: Arc<dyn Tool>,
    /// Every scope the caller must hold
    pub required_scopes: Vec<String>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.tool.name())
            .field("required_scopes", &self.required_scopes)
            .finish()
    }
}

/// Tools by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` under its own name, replacing any previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>, required_scopes: Vec<String>) {
        let name = tool.name().to_string();
        tracing::info!(tool = %name, scopes = ?required_scopes, "Registered tool");
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                required_scopes,
            },
        );
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tool is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Returns its arguments"
        }
        fn execute(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    #[test]
    fn codes_match_kinds() {
        assert_eq!(ToolError::InvalidParams(String::new()).code(), -32602);
        assert_eq!(ToolError::PathNotAllowed(String::new()).code(), -32002);
        assert_eq!(ToolError::FileNotFound(String::new()).code(), -32003);
        assert_eq!(ToolError::FileTooLarge { size: 2, max: 1 }.code(), -32005);
        assert_eq!(ToolError::InvalidExtension(String::new()).code(), -32006);
        assert_eq!(ToolError::Internal(String::new()).code(), -32603);
        assert_eq!(ToolError::FileNotFound("x".into()).kind(), "FileNotFound");
        assert_eq!(ToolError::InvalidCity(String::new()).code(), -32008);
        assert_eq!(ToolError::CityNotFound(String::new()).code(), -32009);
        assert_eq!(ToolError::Network(String::new()).code(), -32013);
        assert_eq!(
            ToolError::ApiRateLimit {
                service: "OpenWeatherMap".into(),
                retry_after: Some(30),
            }
            .kind(),
            "ApiRateLimit"
        );
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo), vec!["echo:run".into()]);

        let entry = registry.get("echo").unwrap();
        assert_eq!(entry.required_scopes, vec!["echo:run"]);
        assert_eq!(entry.tool.execute(json!({"a": 1})).unwrap(), json!({"a": 1}));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["echo"]);
    }
}
