//! Streaming events: state transitions pushed to observers as tasks move
//! through the manager.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use apflow_db::models::TaskStatus;

/// A task state transition, as delivered to transport adapters.
///
/// `final` is true on the last emission for a given task in this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStreamEvent {
    pub task_id: String,
    /// The root task id of the tree this event belongs to.
    pub context_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "final")]
    pub final_: bool,
}

/// Observer of task state transitions.
#[async_trait]
pub trait StreamingCallback: Send + Sync {
    async fn on_event(&self, event: TaskStreamEvent);
}

/// Bridges events onto a bounded channel exposed as a stream, for
/// transports that forward events to remote consumers.
pub struct ChannelCallback {
    tx: mpsc::Sender<TaskStreamEvent>,
}

impl ChannelCallback {
    pub fn new(capacity: usize) -> (Self, ReceiverStream<TaskStreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl StreamingCallback for ChannelCallback {
    async fn on_event(&self, event: TaskStreamEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("streaming consumer dropped, discarding event");
        }
    }
}

/// Collects events in memory. Useful for tests and batch consumers.
#[derive(Default)]
pub struct CollectingCallback {
    events: Mutex<Vec<TaskStreamEvent>>,
}

impl CollectingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<TaskStreamEvent> {
        self.events.lock().await.clone()
    }

    /// Events for one task, in emission order.
    pub async fn events_for(&self, task_id: &str) -> Vec<TaskStreamEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StreamingCallback for CollectingCallback {
    async fn on_event(&self, event: TaskStreamEvent) {
        self.events.lock().await.push(event);
    }
}
