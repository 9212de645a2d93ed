//! Stream event vocabulary shared by the toolgate server and its clients.
//!
//! A tool run is reported as an ordered sequence of [`StreamEvent`]s. Each
//! event is written to the wire as one server-push frame:
//!
//! ```text
//! id: <id>            (only when the event carries an id)
//! event: <type>
//! data: <json>
//!
//! ```
//!
//! Keepalives are comment frames ([`KEEPALIVE_FRAME`]) and carry no event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Comment frame written when no event arrived within the keepalive interval.
pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Kind of a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Request accepted, tool about to run.
    Start,
    /// Lifecycle status change.
    Status,
    /// Percentage progress within a stage.
    Progress,
    /// Terminal failure.
    Error,
    /// Terminal success.
    Complete,
}

impl EventType {
    /// Wire name used on the `event:` line.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    /// `complete` and `error` end the stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Complete)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event in a tool run's stream. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event kind
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Creation time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Free-form payload
    pub data: Value,
    /// Optional event id, emitted as an `id:` line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StreamEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
            id: None,
        }
    }

    /// Attach an id (numeric ids are rendered in decimal).
    #[must_use]
    pub fn with_id(mut self, id: impl ToString) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Whether this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    /// `start` event announcing which tool runs with which parameters.
    #[must_use]
    pub fn start(tool: &str, params: Value) -> Self {
        Self::new(
            EventType::Start,
            json!({
                "tool": tool,
                "params": params,
                "status": "started",
            }),
        )
    }

    /// `status` event.
    #[must_use]
    pub fn status(status: &str, message: impl Into<String>, metadata: Option<Value>) -> Self {
        let mut data = Map::new();
        data.insert("status".into(), Value::from(status));
        data.insert("message".into(), Value::from(message.into()));
        if let Some(metadata) = metadata {
            data.insert("metadata".into(), metadata);
        }
        Self::new(EventType::Status, Value::Object(data))
    }

    /// `progress` event; `progress` is a percentage in `0..=100`.
    #[must_use]
    pub fn progress(
        stage: &str,
        progress: u8,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        let mut data = Map::new();
        data.insert("stage".into(), Value::from(stage));
        data.insert("progress".into(), Value::from(progress.min(100)));
        data.insert("message".into(), Value::from(message.into()));
        if let Some(details) = details {
            data.insert("details".into(), details);
        }
        Self::new(EventType::Progress, Value::Object(data))
    }

    /// Terminal `error` event.
    #[must_use]
    pub fn error(error_type: &str, error_message: impl Into<String>, error_code: Option<i32>) -> Self {
        let mut data = Map::new();
        data.insert("error_type".into(), Value::from(error_type));
        data.insert("error_message".into(), Value::from(error_message.into()));
        if let Some(code) = error_code {
            data.insert("error_code".into(), Value::from(code));
        }
        Self::new(EventType::Error, Value::Object(data))
    }

    /// Terminal `complete` event.
    #[must_use]
    pub fn complete(result: Value, duration_ms: f64, success: bool) -> Self {
        Self::new(
            EventType::Complete,
            json!({
                "success": success,
                "result": result,
                "duration_ms": duration_ms,
                "completed_at": Utc::now().to_rfc3339(),
            }),
        )
    }

    /// Encode as a server-push frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        let mut frame = String::new();
        if let Some(ref id) = self.id {
            frame.push_str("id: ");
            frame.push_str(id);
            frame.push('\n');
        }
        frame.push_str("event: ");
        frame.push_str(self.event_type.as_str());
        frame.push('\n');
        frame.push_str("data: ");
        frame.push_str(&self.data.to_string());
        frame.push_str("\n\n");
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn terminal_types() {
        assert!(EventType::Complete.is_terminal());
        assert!(EventType::Error.is_terminal());
        assert!(!EventType::Start.is_terminal());
        assert!(!EventType::Status.is_terminal());
        assert!(!EventType::Progress.is_terminal());
    }

    #[test]
    fn frame_without_id() {
        let event = StreamEvent::new(EventType::Progress, json!({"progress": 50}));
        assert_eq!(event.to_frame(), "event: progress\ndata: {\"progress\":50}\n\n");
    }

    #[test]
    fn frame_with_id_puts_id_line_first() {
        let event = StreamEvent::new(EventType::Status, json!({"status": "starting"})).with_id(7);
        assert_eq!(
            event.to_frame(),
            "id: 7\nevent: status\ndata: {\"status\":\"starting\"}\n\n"
        );
    }

    #[test]
    fn keepalive_is_comment_frame() {
        assert!(KEEPALIVE_FRAME.starts_with(':'));
        assert!(KEEPALIVE_FRAME.ends_with("\n\n"));
    }

    #[test]
    fn progress_clamps_percentage() {
        let event = StreamEvent::progress("execution", 250, "running", None);
        assert_eq!(event.data["progress"], 100);
        assert!(event.data.get("details").is_none());
    }

    #[test]
    fn error_omits_absent_code() {
        let event = StreamEvent::error("InvalidParams", "bad input", None);
        assert_eq!(event.data["error_type"], "InvalidParams");
        assert!(event.data.get("error_code").is_none());

        let event = StreamEvent::error("FileNotFound", "missing", Some(-32003));
        assert_eq!(event.data["error_code"], -32003);
    }

    #[test]
    fn event_serializes_type_field() {
        let event = StreamEvent::complete(json!({"ok": true}), 12.5, true);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["data"]["success"], true);
        assert!(value.get("id").is_none());
    }
}
