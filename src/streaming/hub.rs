//! Event Stream Engine
//!
//! One bounded FIFO channel per streamed request, keyed by a correlation id
//! chosen by the caller. Producers push [`StreamEvent`]s through the
//! [`StreamHub`]; the single consumer drains its [`StreamReceiver`] into
//! server-push frames, emitting a keepalive after every idle interval and
//! ending on the first terminal event.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::Event;
use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use toolgate_core::{EventType, KEEPALIVE_FRAME, StreamEvent};

#[derive(Debug)]
struct ChannelEntry {
    tx: mpsc::Sender<StreamEvent>,
    /// Distinguishes a replaced channel from its successor under the same id
    epoch: u64,
}

type ChannelTable = DashMap<String, ChannelEntry>;

/// Table of live stream channels shared by all requests.
#[derive(Debug, Clone)]
pub struct StreamHub {
    channels: Arc<ChannelTable>,
    buffer_size: usize,
    keepalive: Duration,
    next_epoch: Arc<AtomicU64>,
}

impl StreamHub {
    /// Create a hub whose channels hold `buffer_size` events and whose
    /// consumers emit a keepalive after `keepalive` without events.
    #[must_use]
    pub fn new(buffer_size: usize, keepalive: Duration) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            buffer_size: buffer_size.max(1),
            keepalive,
            next_epoch: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a hub from the streaming configuration.
    #[must_use]
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.buffer_size, config.keepalive_interval)
    }

    /// Allocate the channel for `request_id` and return its consuming end.
    ///
    /// Create the channel before starting the producer so no early event is
    /// lost. An existing channel under the same id is replaced; its consumer
    /// sees the stream end.
    pub fn create(&self, request_id: impl Into<String>) -> StreamReceiver {
        let request_id = request_id.into();
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);

        if self
            .channels
            .insert(request_id.clone(), ChannelEntry { tx, epoch })
            .is_some()
        {
            warn!(request_id = %request_id, "Replaced existing stream channel");
        }
        info!(request_id = %request_id, "Created stream channel");

        StreamReceiver {
            request_id,
            rx,
            keepalive: self.keepalive,
            channels: Arc::clone(&self.channels),
            epoch,
        }
    }

    /// Whether a channel for `request_id` is live.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.channels.contains_key(request_id)
    }

    /// Number of live channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Enqueue an event built from `event_type` and `data`.
    ///
    /// Returns `false` (and logs a warning) when the channel no longer exists
    /// or its consumer has gone away.
    pub async fn send(&self, request_id: &str, event_type: EventType, data: Value) -> bool {
        self.send_event(request_id, StreamEvent::new(event_type, data))
            .await
    }

    /// Enqueue a prebuilt event.
    pub async fn send_event(&self, request_id: &str, event: StreamEvent) -> bool {
        // Clone the sender so no table guard is held across the await
        let tx = match self.channels.get(request_id) {
            Some(entry) => entry.tx.clone(),
            None => {
                warn!(request_id = %request_id, event_type = %event.event_type, "Stream channel not found");
                return false;
            }
        };

        let event_type = event.event_type;
        if tx.send(event).await.is_err() {
            warn!(request_id = %request_id, event_type = %event_type, "Stream consumer disconnected");
            return false;
        }
        debug!(request_id = %request_id, event_type = %event_type, "Stream event queued");
        true
    }

    /// Enqueue a `progress` event.
    pub async fn send_progress(
        &self,
        request_id: &str,
        stage: &str,
        progress: u8,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> bool {
        self.send_event(request_id, StreamEvent::progress(stage, progress, message, details))
            .await
    }

    /// Enqueue a `status` event.
    pub async fn send_status(
        &self,
        request_id: &str,
        status: &str,
        message: impl Into<String>,
        metadata: Option<Value>,
    ) -> bool {
        self.send_event(request_id, StreamEvent::status(status, message, metadata))
            .await
    }

    /// Enqueue a terminal `error` event.
    pub async fn send_error(
        &self,
        request_id: &str,
        error_type: &str,
        error_message: impl Into<String>,
        error_code: Option<i32>,
    ) -> bool {
        self.send_event(request_id, StreamEvent::error(error_type, error_message, error_code))
            .await
    }

    /// Enqueue a terminal `complete` event.
    pub async fn send_complete(
        &self,
        request_id: &str,
        result: Value,
        duration_ms: f64,
        success: bool,
    ) -> bool {
        self.send_event(request_id, StreamEvent::complete(result, duration_ms, success))
            .await
    }
}

/// One unit of stream output.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A queued event
    Event(StreamEvent),
    /// Idle-interval comment frame
    KeepAlive,
}

impl Frame {
    /// Wire encoding of this frame.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Event(event) => event.to_frame(),
            Self::KeepAlive => KEEPALIVE_FRAME.to_string(),
        }
    }
}

impl From<Frame> for Event {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Event(event) => {
                let sse = Event::default();
                let sse = match event.id {
                    Some(ref id) => sse.id(id.clone()),
                    None => sse,
                };
                sse.event(event.event_type.as_str())
                    .data(event.data.to_string())
            }
            Frame::KeepAlive => Event::default().comment("keepalive"),
        }
    }
}

/// Consuming end of one stream channel.
///
/// Dropping it tears the channel down, so a disconnected client frees its
/// slot even if the producer is still running.
#[derive(Debug)]
pub struct StreamReceiver {
    request_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    keepalive: Duration,
    channels: Arc<ChannelTable>,
    epoch: u64,
}

impl StreamReceiver {
    /// Correlation id of this channel.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Drain the channel into frames.
    ///
    /// Yields each event in enqueue order and a [`Frame::KeepAlive`] after
    /// every idle interval. Ends right after the first terminal event, or when
    /// every producer handle is gone.
    pub fn consume(self) -> impl Stream<Item = Frame> + Send + 'static {
        let mut receiver = self;
        stream! {
            loop {
                match tokio::time::timeout(receiver.keepalive, receiver.rx.recv()).await {
                    Ok(Some(event)) => {
                        let terminal = event.is_terminal();
                        yield Frame::Event(event);
                        if terminal {
                            debug!(request_id = %receiver.request_id, "Terminal event consumed");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(request_id = %receiver.request_id, "Stream producer closed");
                        break;
                    }
                    Err(_) => yield Frame::KeepAlive,
                }
            }
        }
    }

    /// [`consume`](Self::consume) adapted to axum's SSE event type.
    pub fn into_sse_stream(
        self,
    ) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        use futures::StreamExt as _;
        self.consume().map(|frame| Ok(Event::from(frame)))
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if self
            .channels
            .remove_if(&self.request_id, |_, entry| entry.epoch == self.epoch)
            .is_some()
        {
            info!(request_id = %self.request_id, "Closed stream channel");
        }
    }
}
