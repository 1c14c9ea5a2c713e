use serde_json::{Value, json};

use crate::error::ErrorKind;
use crate::types::Message;

/// Lifecycle events emitted by the agent loop and runtime. Within a
/// session these observe a total order matching causal order; delta
/// events may be suppressed by configuration but are never reordered.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    TurnStart,
    MessageStart {
        message: Message,
    },
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    ToolCallDelta {
        delta: String,
    },
    /// Partial-message snapshot, emitted when a content block completes.
    MessageUpdate {
        message: Message,
    },
    MessageEnd {
        message: Message,
    },
    ToolExecutionStart {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolExecutionEnd {
        call_id: String,
        name: String,
        is_error: bool,
        duration_ms: u64,
        truncated: bool,
    },
    TurnEnd,
    AgentEnd {
        messages: Vec<Message>,
    },
    CompactionStart,
    CompactionEnd {
        tokens_before: u64,
        tokens_after: u64,
    },
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: String,
    },
    RetryAborted {
        attempt: u32,
    },
    RetryExhausted {
        attempts: u32,
        error: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::AgentStart => "agent_start",
            AgentEvent::TurnStart => "turn_start",
            AgentEvent::MessageStart { .. } => "message_start",
            AgentEvent::TextDelta { .. } => "text_delta",
            AgentEvent::ThinkingDelta { .. } => "thinking_delta",
            AgentEvent::ToolCallDelta { .. } => "tool_call_delta",
            AgentEvent::MessageUpdate { .. } => "message_update",
            AgentEvent::MessageEnd { .. } => "message_end",
            AgentEvent::ToolExecutionStart { .. } => "tool_execution_start",
            AgentEvent::ToolExecutionEnd { .. } => "tool_execution_end",
            AgentEvent::TurnEnd => "turn_end",
            AgentEvent::AgentEnd { .. } => "agent_end",
            AgentEvent::CompactionStart => "compaction_start",
            AgentEvent::CompactionEnd { .. } => "compaction_end",
            AgentEvent::RetryScheduled { .. } => "llm_retry_scheduled",
            AgentEvent::RetryAborted { .. } => "llm_retry_aborted",
            AgentEvent::RetryExhausted { .. } => "llm_retry_exhausted",
            AgentEvent::Error { .. } => "error",
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(
            self,
            AgentEvent::TextDelta { .. }
                | AgentEvent::ThinkingDelta { .. }
                | AgentEvent::ToolCallDelta { .. }
        )
    }

    /// Flat wire representation: a JSON object whose `type` field carries
    /// the event token. Unknown types must be ignored by consumers.
    pub fn to_wire(&self) -> Value {
        let mut obj = match self {
            AgentEvent::AgentStart
            | AgentEvent::TurnStart
            | AgentEvent::TurnEnd
            | AgentEvent::CompactionStart => json!({}),
            AgentEvent::MessageStart { message }
            | AgentEvent::MessageUpdate { message }
            | AgentEvent::MessageEnd { message } => json!({ "message": message }),
            AgentEvent::TextDelta { delta }
            | AgentEvent::ThinkingDelta { delta }
            | AgentEvent::ToolCallDelta { delta } => json!({ "delta": delta }),
            AgentEvent::ToolExecutionStart {
                call_id,
                name,
                arguments,
            } => json!({ "call_id": call_id, "name": name, "arguments": arguments }),
            AgentEvent::ToolExecutionEnd {
                call_id,
                name,
                is_error,
                duration_ms,
                truncated,
            } => json!({
                "call_id": call_id,
                "name": name,
                "is_error": is_error,
                "duration_ms": duration_ms,
                "truncated": truncated,
            }),
            AgentEvent::AgentEnd { messages } => json!({ "message_count": messages.len() }),
            AgentEvent::CompactionEnd {
                tokens_before,
                tokens_after,
            } => json!({ "tokens_before": tokens_before, "tokens_after": tokens_after }),
            AgentEvent::RetryScheduled {
                attempt,
                max_attempts,
                delay_ms,
                error,
            } => json!({
                "attempt": attempt,
                "max_attempts": max_attempts,
                "delay_ms": delay_ms,
                "error": error,
            }),
            AgentEvent::RetryAborted { attempt } => json!({ "attempt": attempt }),
            AgentEvent::RetryExhausted { attempts, error } => {
                json!({ "attempts": attempts, "error": error })
            }
            AgentEvent::Error { kind, message } => {
                json!({ "kind": kind.as_str(), "message": message })
            }
        };
        obj.as_object_mut()
            .expect("wire event is an object")
            .insert("type".to_string(), Value::String(self.event_type().to_string()));
        obj
    }
}

/// Event sink shared between the loop, the executor, and the runtime.
/// Implementations serialize delivery so event order is preserved.
pub type EventSink = std::sync::Arc<dyn Fn(&AgentEvent) + Send + Sync>;

pub fn null_sink() -> EventSink {
    std::sync::Arc::new(|_| {})
}
