// ABOUTME: Typed lifecycle events published by agents and the orchestrator for external observers.
// ABOUTME: EventBus wraps a tokio broadcast channel; publishing never blocks and never fails the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::plan::{PlanResult, PlanStep, PlanTask};
use crate::tool::ToolResult;

/// An event envelope: sequence number, emitting component, and timestamped payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    /// Agent name, or "orchestrator" for workflow events.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// The closed set of lifecycle notifications. Each payload is self-contained so an
/// observer can follow progress without access to internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    AgentTaskStarted {
        task: String,
    },
    AgentToolCall {
        tool: String,
        arguments: Value,
    },
    AgentToolResult {
        tool: String,
        result: ToolResult,
    },
    AgentTaskFinished {
        task: String,
        response: String,
    },
    AgentError {
        error: String,
        tool: Option<String>,
    },
    WorkflowStarted {
        objective: String,
    },
    StepStarted {
        step_index: usize,
        step: PlanStep,
    },
    StepFinished {
        step_index: usize,
        step: PlanStep,
    },
    TaskStarted {
        step_index: usize,
        task_index: usize,
        task: PlanTask,
    },
    TaskFinished {
        step_index: usize,
        task_index: usize,
        task: PlanTask,
    },
    WorkflowError {
        error: String,
        step_index: Option<usize>,
        task_index: Option<usize>,
        agent: Option<String>,
    },
    WorkflowFinished {
        result: PlanResult,
    },
}

impl EventPayload {
    /// Short kind label, e.g. "step:start".
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::AgentTaskStarted { .. } => "agent:start",
            EventPayload::AgentToolCall { .. } => "agent:tool:call",
            EventPayload::AgentToolResult { .. } => "agent:tool:result",
            EventPayload::AgentTaskFinished { .. } => "agent:end",
            EventPayload::AgentError { .. } => "agent:error",
            EventPayload::WorkflowStarted { .. } => "start",
            EventPayload::StepStarted { .. } => "step:start",
            EventPayload::StepFinished { .. } => "step:end",
            EventPayload::TaskStarted { .. } => "task:start",
            EventPayload::TaskFinished { .. } => "task:end",
            EventPayload::WorkflowError { .. } => "error",
            EventPayload::WorkflowFinished { .. } => "end",
        }
    }
}

/// Cloneable publish/subscribe handle. Clones share the channel and the sequence counter.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish a payload and return its event id.
    pub fn publish(&self, source: &str, payload: EventPayload) -> u64 {
        let event_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            event_id,
            source: source.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        // No subscribers is fine
        let _ = self.tx.send(event);
        event_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`; lagged receivers surface as stream errors.
    pub fn stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            "orchestrator",
            EventPayload::WorkflowStarted {
                objective: "ship it".into(),
            },
        );
        bus.publish(
            "orchestrator",
            EventPayload::WorkflowError {
                error: "boom".into(),
                step_index: Some(0),
                task_index: None,
                agent: None,
            },
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload.kind(), "start");
        assert_eq!(second.payload.kind(), "error");
        assert!(second.event_id > first.event_id);
        assert_eq!(first.source, "orchestrator");
    }

    #[test]
    fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new(4);
        let id = bus.publish(
            "writer",
            EventPayload::AgentTaskStarted {
                task: "draft".into(),
            },
        );
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn stream_yields_published_events() {
        let bus = EventBus::default();
        let mut stream = bus.stream();
        bus.publish(
            "writer",
            EventPayload::AgentTaskFinished {
                task: "draft".into(),
                response: "done".into(),
            },
        );
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.payload.kind(), "agent:end");
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::StepStarted {
            step_index: 1,
            step: PlanStep {
                objective: "write".into(),
                tasks: vec![PlanTask::new("write X", "writer")],
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "StepStarted");
        assert_eq!(json["step"]["tasks"][0]["agent"], "writer");
    }
}
