use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::events::AgentEvent;
use crate::executor::ToolExecutor;
use crate::stream::{EventStream, StreamFn};
use crate::types::{
    AssistantEvent, LlmContext, Message, Model, StopReason, StreamOptions, ToolSpec,
};

// ---------- Queue plumbing ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    All,
    OneAtATime,
}

impl QueueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "one-at-a-time" => Some(Self::OneAtATime),
            _ => None,
        }
    }
}

pub type MessageQueueFuture = Pin<Box<dyn Future<Output = Vec<Message>> + Send>>;
pub type MessageQueueFn = dyn Fn() -> MessageQueueFuture + Send + Sync;

// ---------- Loop configuration ----------

pub struct LoopConfig {
    pub model: Model,
    pub system_prompt: Option<String>,
    pub options: StreamOptions,
    /// Drained between LLM turns; steering messages join the next request
    /// without cancelling the in-flight stream.
    pub get_steering: Option<Arc<MessageQueueFn>>,
    /// Drained once the agent would otherwise stop.
    pub get_follow_up: Option<Arc<MessageQueueFn>>,
    /// Emit per-token delta events. Block-level updates are always sent.
    pub emit_deltas: bool,
}

/// What one run produced: every message generated (prompts included)
/// plus the raw adapter error when the run ended on a failed stream.
#[derive(Debug, Clone, Default)]
pub struct LoopOutcome {
    pub messages: Vec<Message>,
    pub llm_error: Option<String>,
}

pub type AgentStream = EventStream<AgentEvent, LoopOutcome>;

/// Drive one agent run: prompts are appended to the context, then the
/// loop alternates LLM streaming and tool execution until the assistant
/// stops calling tools, the run is aborted, or an error surfaces.
/// Returns a stream of lifecycle events whose result is a `LoopOutcome`.
pub fn run_agent_loop(
    prompts: Vec<Message>,
    context_messages: Vec<Message>,
    tool_specs: Vec<ToolSpec>,
    executor: Arc<ToolExecutor>,
    config: LoopConfig,
    cancel: CancellationToken,
    stream_fn: StreamFn,
) -> AgentStream {
    let stream: AgentStream = EventStream::new();
    let events = stream.clone();

    tokio::spawn(async move {
        let mut context = context_messages;
        let mut new_messages: Vec<Message> = Vec::new();
        let mut llm_error: Option<String> = None;

        events.emit(AgentEvent::AgentStart);
        events.emit(AgentEvent::TurnStart);
        let mut turn_open = true;

        let mut pending = prompts;
        let mut first_turn = true;

        // Outer loop continues when follow-up prompts are queued.
        'run: loop {
            let mut has_tool_calls = true;

            // Inner loop alternates streaming and tool execution.
            while has_tool_calls || !pending.is_empty() {
                if cancel.is_cancelled() {
                    break 'run;
                }

                if !first_turn {
                    events.emit(AgentEvent::TurnStart);
                    turn_open = true;
                }
                first_turn = false;

                for message in pending.drain(..) {
                    events.emit(AgentEvent::MessageStart {
                        message: message.clone(),
                    });
                    events.emit(AgentEvent::MessageEnd {
                        message: message.clone(),
                    });
                    context.push(message.clone());
                    new_messages.push(message);
                }

                let (assistant, stream_error) = stream_assistant(
                    &context,
                    &tool_specs,
                    &config,
                    &cancel,
                    &events,
                    &stream_fn,
                )
                .await;
                llm_error = stream_error;
                context.push(assistant.clone());
                new_messages.push(assistant.clone());

                if matches!(
                    assistant.stop_reason,
                    Some(StopReason::Error) | Some(StopReason::Aborted)
                ) {
                    break 'run;
                }

                let tool_calls: Vec<_> =
                    assistant.tool_calls().into_iter().cloned().collect();
                has_tool_calls = !tool_calls.is_empty();

                if has_tool_calls {
                    if cancel.is_cancelled() {
                        break 'run;
                    }

                    let executor_sink = loop_sink(&events);
                    let outcomes = executor
                        .dispatch(tool_calls, cancel.clone(), executor_sink)
                        .await;

                    for outcome in outcomes {
                        let result = Message::tool_result(
                            outcome.call_id,
                            outcome.name,
                            outcome.content,
                            outcome.is_error,
                        );
                        events.emit(AgentEvent::MessageStart {
                            message: result.clone(),
                        });
                        events.emit(AgentEvent::MessageEnd {
                            message: result.clone(),
                        });
                        context.push(result.clone());
                        new_messages.push(result);
                    }
                }

                events.emit(AgentEvent::TurnEnd);
                turn_open = false;

                if let Some(get_steering) = &config.get_steering {
                    pending = get_steering().await;
                }
            }

            if let Some(get_follow_up) = &config.get_follow_up {
                let follow_up = get_follow_up().await;
                if !follow_up.is_empty() {
                    pending = follow_up;
                    continue 'run;
                }
            }

            break;
        }

        // Aborted and failed runs leave the current turn unclosed.
        if turn_open {
            events.emit(AgentEvent::TurnEnd);
        }

        events.emit(AgentEvent::AgentEnd {
            messages: new_messages.clone(),
        });
        events.finish(Some(LoopOutcome {
            messages: new_messages,
            llm_error,
        }));
    });

    stream
}

fn loop_sink(events: &AgentStream) -> crate::events::EventSink {
    let events = events.clone();
    Arc::new(move |event: &AgentEvent| events.emit(event.clone()))
}

/// Stream one assistant message, forwarding deltas as events. Always
/// returns a finalized message (an aborted stream yields the partial
/// content with `stop_reason = aborted`) plus the raw adapter error if
/// the stream failed.
async fn stream_assistant(
    context: &[Message],
    tool_specs: &[ToolSpec],
    config: &LoopConfig,
    cancel: &CancellationToken,
    events: &AgentStream,
    stream_fn: &StreamFn,
) -> (Message, Option<String>) {
    let llm_context = LlmContext {
        system_prompt: config.system_prompt.clone(),
        messages: context
            .iter()
            .filter(|m| m.agent_visible)
            .cloned()
            .collect(),
        tools: if tool_specs.is_empty() {
            None
        } else {
            Some(tool_specs.to_vec())
        },
    };

    let mut response = Box::pin(stream_fn(&config.model, &llm_context, &config.options));

    let mut partial: Option<Message> = None;
    let mut started = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                let mut message = partial.take().unwrap_or_else(|| Message::assistant(vec![]));
                message.stop_reason = Some(StopReason::Aborted);
                if !started {
                    events.emit(AgentEvent::MessageStart {
                        message: message.clone(),
                    });
                }
                events.emit(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                return (message, None);
            }
            next = response.next() => match next {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            AssistantEvent::Start { partial: p } => {
                started = true;
                partial = Some(p.clone());
                events.emit(AgentEvent::MessageStart { message: p });
            }
            AssistantEvent::TextDelta { delta, partial: p, .. } => {
                partial = Some(p);
                if config.emit_deltas {
                    events.emit(AgentEvent::TextDelta { delta });
                }
            }
            AssistantEvent::ThinkingDelta { delta, partial: p, .. } => {
                partial = Some(p);
                if config.emit_deltas {
                    events.emit(AgentEvent::ThinkingDelta { delta });
                }
            }
            AssistantEvent::ToolCallDelta { delta, partial: p, .. } => {
                partial = Some(p);
                if config.emit_deltas {
                    events.emit(AgentEvent::ToolCallDelta { delta });
                }
            }
            AssistantEvent::ToolCallEnd { partial: p, .. } => {
                partial = Some(p.clone());
                events.emit(AgentEvent::MessageUpdate { message: p });
            }
            AssistantEvent::Done { message } => {
                if !started {
                    events.emit(AgentEvent::MessageStart {
                        message: message.clone(),
                    });
                }
                events.emit(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                return (message, None);
            }
            AssistantEvent::Error { mut message, error } => {
                tracing::warn!("llm stream failed: {error}");
                message.stop_reason = Some(StopReason::Error);
                if !started {
                    events.emit(AgentEvent::MessageStart {
                        message: message.clone(),
                    });
                }
                events.emit(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                return (message, Some(error));
            }
        }
    }

    // Stream ended without a terminal event; treat as an adapter error.
    let mut message = partial.unwrap_or_else(|| Message::assistant(vec![]));
    message.stop_reason = Some(StopReason::Error);
    if !started {
        events.emit(AgentEvent::MessageStart {
            message: message.clone(),
        });
    }
    events.emit(AgentEvent::MessageEnd {
        message: message.clone(),
    });
    (
        message,
        Some("stream ended unexpectedly without a terminal event".to_string()),
    )
}
