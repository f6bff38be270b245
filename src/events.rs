use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Started,
    Output,
    Warning,
    Error,
    Completed,
}

/// One message pushed to a client stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub status: EventStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl StreamEvent {
    pub fn new(status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn started(message: impl Into<String>) -> Self {
        Self::new(EventStatus::Started, message)
    }

    pub fn output(message: impl Into<String>) -> Self {
        Self::new(EventStatus::Output, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EventStatus::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventStatus::Error, message)
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(EventStatus::Completed, message)
    }
}

/// Receiving end of a stream publisher. Emitting never fails; a gone client is only observable via `is_closed`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StreamEvent);

    fn is_closed(&self) -> bool {
        false
    }
}

/// Bounded channel sink; the HTTP layer turns the receiver into an SSE response.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Event receiver dropped; discarding event");
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
