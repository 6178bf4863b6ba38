use super::Redactor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Update,
    Complete,
    Error,
}

/// One entry of an execution's event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Position in the execution's sequence, starting at 0.
    pub sequence: u64,
    pub data: Value,
    pub trace_id: String,
}

impl ExecutionEvent {
    /// The `status` field of the payload, if any.
    pub fn status(&self) -> Option<&str> {
        self.data.get("status").and_then(|s| s.as_str())
    }
}

/// Engine-wide event fan-out.
///
/// Subscribers only see events published after they attach; there is no
/// buffered history beyond what a lagging receiver has not read yet.
pub struct EventStream {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Every event of every execution.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Events of a single execution, from now on.
    pub fn subscribe_execution(&self, execution_id: ExecutionId) -> ExecutionSubscription {
        ExecutionSubscription {
            execution_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Create the single producer for one execution.
    pub fn publisher(
        &self,
        execution_id: ExecutionId,
        trace_id: impl Into<String>,
        redactor: Redactor,
    ) -> EventPublisher {
        EventPublisher {
            inner: Arc::new(PublisherInner {
                execution_id,
                trace_id: trace_id.into(),
                redactor,
                sender: self.sender.clone(),
                next_sequence: Mutex::new(0),
            }),
        }
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(1024)
    }
}

struct PublisherInner {
    execution_id: ExecutionId,
    trace_id: String,
    redactor: Redactor,
    sender: broadcast::Sender<ExecutionEvent>,
    next_sequence: Mutex<u64>,
}

/// Ordered, redacting producer for one execution's events.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<PublisherInner>,
}

impl EventPublisher {
    pub fn execution_id(&self) -> ExecutionId {
        self.inner.execution_id
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    /// Continue numbering from a previous run of the same execution.
    pub fn resume_from(&self, sequence: u64) {
        if let Ok(mut next) = self.inner.next_sequence.lock() {
            *next = (*next).max(sequence);
        }
    }

    /// Sequence number the next event will carry.
    pub fn next_sequence(&self) -> u64 {
        self.inner.next_sequence.lock().map(|n| *n).unwrap_or_default()
    }

    pub fn emit(&self, kind: EventKind, node_id: Option<&str>, mut data: Value) {
        self.inner.redactor.redact(&mut data);

        // Sequence assignment and send happen under one lock so that
        // sequence order and delivery order agree.
        let Ok(mut next) = self.inner.next_sequence.lock() else {
            return;
        };
        let event = ExecutionEvent {
            kind,
            timestamp: Utc::now(),
            execution_id: self.inner.execution_id,
            node_id: node_id.map(str::to_string),
            sequence: *next,
            data,
            trace_id: self.inner.trace_id.clone(),
        };
        *next += 1;
        let _ = self.inner.sender.send(event);
    }

    pub fn update(&self, node_id: Option<&str>, data: Value) {
        self.emit(EventKind::Update, node_id, data);
    }

    pub fn complete(&self, data: Value) {
        self.emit(EventKind::Complete, None, data);
    }

    pub fn error(&self, node_id: Option<&str>, data: Value) {
        self.emit(EventKind::Error, node_id, data);
    }

    pub fn emitter(&self, node_id: impl Into<String>) -> EventEmitter {
        EventEmitter {
            publisher: self.clone(),
            node_id: node_id.into(),
        }
    }
}

/// Event emitter for nodes to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    publisher: EventPublisher,
    node_id: String,
}

impl EventEmitter {
    pub fn info(&self, message: impl Into<String>) {
        self.publisher.update(
            Some(&self.node_id),
            json!({"event": "info", "message": message.into()}),
        );
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.publisher.update(
            Some(&self.node_id),
            json!({"event": "warning", "message": message.into()}),
        );
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.publisher.update(
            Some(&self.node_id),
            json!({"event": "progress", "percent": percent, "message": message}),
        );
    }

    /// Arbitrary node-specific payload.
    pub fn data(&self, data: Value) {
        self.publisher.update(Some(&self.node_id), data);
    }
}

/// Receiver filtered to one execution.
pub struct ExecutionSubscription {
    execution_id: ExecutionId,
    receiver: broadcast::Receiver<ExecutionEvent>,
}

impl ExecutionSubscription {
    /// Next event of this execution, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.execution_id == self.execution_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        missed,
                        "Event subscriber lagged, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.execution_id == self.execution_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscribers_only_see_new_events() {
        let stream = EventStream::new(16);
        let execution_id = Uuid::new_v4();
        let publisher = stream.publisher(execution_id, "trace-1", Redactor::default());

        publisher.update(Some("a"), json!({"status": "running"}));
        let mut late = stream.subscribe_execution(execution_id);
        publisher.update(Some("a"), json!({"status": "completed"}));

        let event = late.recv().await.unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.status(), Some("completed"));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscription_ignores_other_executions() {
        let stream = EventStream::new(16);
        let mine = Uuid::new_v4();
        let mut sub = stream.subscribe_execution(mine);

        stream
            .publisher(Uuid::new_v4(), "t", Redactor::default())
            .complete(json!({"status": "completed"}));
        stream
            .publisher(mine, "t", Redactor::default())
            .complete(json!({"status": "failed"}));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.execution_id, mine);
        assert_eq!(event.kind, EventKind::Complete);
    }
}
