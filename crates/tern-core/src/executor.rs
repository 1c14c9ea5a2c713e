use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, ErrorKind};
use crate::events::{AgentEvent, EventSink};
use crate::types::{ContentBlock, ToolCall, ToolSpec};

/// The narrow interface a tool implementation exposes to the kernel.
/// Implementations live outside this crate.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> &ToolSpec;

    async fn execute(
        &self,
        call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<ContentBlock>, CoreError>;
}

/// Line and byte caps applied to every text block a tool returns.
#[derive(Debug, Clone)]
pub struct OutputLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_lines: 1000,
            max_bytes: 100_000,
        }
    }
}

pub struct ClampedOutput {
    pub text: String,
    pub was_clamped: bool,
}

impl OutputLimits {
    /// Accumulate lines forward until either budget runs out; a line
    /// that blows the byte budget is cut mid-line, character by
    /// character, so the cut always lands on a UTF-8 boundary. Clamped
    /// output ends with a "(truncated)" marker naming what survived.
    pub fn clamp(&self, text: &str) -> ClampedOutput {
        let total_lines = text.lines().count();
        if total_lines <= self.max_lines && text.len() <= self.max_bytes {
            return ClampedOutput {
                text: text.to_string(),
                was_clamped: false,
            };
        }

        let mut kept = String::new();
        let mut kept_lines = 0usize;
        'lines: for line in text.lines() {
            if kept_lines == self.max_lines {
                break;
            }
            if kept_lines > 0 {
                if kept.len() + 1 > self.max_bytes {
                    break;
                }
                kept.push('\n');
            }
            for ch in line.chars() {
                if kept.len() + ch.len_utf8() > self.max_bytes {
                    break 'lines;
                }
                kept.push(ch);
            }
            kept_lines += 1;
        }

        kept.push_str(&format!(
            "\n(truncated: kept {kept_lines} of {total_lines} lines, {} of {} bytes)",
            kept.len(),
            text.len()
        ));
        ClampedOutput {
            text: kept,
            was_clamped: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_tools: usize,
    pub tool_timeout: Duration,
    pub queue_timeout: Duration,
    pub output: OutputLimits,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tools: 4,
            tool_timeout: Duration::from_secs(120),
            queue_timeout: Duration::from_secs(30),
            output: OutputLimits::default(),
        }
    }
}

/// One tool execution's outcome, in the shape tool_result messages are
/// built from.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
    pub duration: Duration,
    pub truncated: bool,
}

/// Bounded-concurrency tool pool. Admission waits on a semaphore up to
/// `queue_timeout`; each execution is bounded by `tool_timeout`; a
/// cancelled turn aborts everything outstanding. Results come back in
/// the original call order regardless of completion order.
pub struct ToolExecutor {
    tools: Mutex<HashMap<String, Arc<dyn ToolAdapter>>>,
    semaphore: Arc<Semaphore>,
    config: ExecutorConfig,
    active: Mutex<Vec<ActiveCall>>,
    next_call_seq: std::sync::atomic::AtomicU64,
}

struct ActiveCall {
    seq: u64,
    tool_name: String,
    token: CancellationToken,
}

impl ToolExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tools.max(1))),
            config,
            active: Mutex::new(Vec::new()),
            next_call_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn register(&self, tool: Arc<dyn ToolAdapter>) {
        self.tools
            .lock()
            .unwrap()
            .insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.tools.lock().unwrap().get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .lock()
            .unwrap()
            .values()
            .map(|t| t.spec().clone())
            .collect()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Cancel all in-flight executions of a named tool without touching
    /// the rest of the turn.
    pub fn abort_named(&self, name: &str) {
        for call in self.active.lock().unwrap().iter() {
            if call.tool_name == name {
                call.token.cancel();
            }
        }
    }

    /// Run every call concurrently and return outcomes aligned 1:1 with
    /// the input order.
    pub async fn dispatch(
        self: &Arc<Self>,
        calls: Vec<ToolCall>,
        cancel: CancellationToken,
        sink: EventSink,
    ) -> Vec<ToolOutcome> {
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            let executor = self.clone();
            let cancel = cancel.clone();
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                executor.run_one(call, cancel, sink).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!("tool task panicked: {e}");
                }
            }
        }
        outcomes
    }

    async fn run_one(
        self: Arc<Self>,
        call: ToolCall,
        cancel: CancellationToken,
        sink: EventSink,
    ) -> ToolOutcome {
        let started = std::time::Instant::now();
        let call_token = cancel.child_token();
        let seq = self
            .next_call_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.active.lock().unwrap().push(ActiveCall {
            seq,
            tool_name: call.name.clone(),
            token: call_token.clone(),
        });

        // Start/end always pair up, even for calls that die in the queue.
        sink(&AgentEvent::ToolExecutionStart {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let outcome = self.admit_and_execute(&call, call_token, started).await;

        self.active.lock().unwrap().retain(|c| c.seq != seq);

        sink(&AgentEvent::ToolExecutionEnd {
            call_id: outcome.call_id.clone(),
            name: outcome.name.clone(),
            is_error: outcome.is_error,
            duration_ms: outcome.duration.as_millis() as u64,
            truncated: outcome.truncated,
        });
        outcome
    }

    async fn admit_and_execute(
        &self,
        call: &ToolCall,
        call_token: CancellationToken,
        started: std::time::Instant,
    ) -> ToolOutcome {
        // Queue admission, bounded by queue_timeout.
        let permit = tokio::select! {
            _ = call_token.cancelled() => {
                return self.failed(call, ErrorKind::Aborted, "tool execution aborted", started);
            }
            acquired = tokio::time::timeout(
                self.config.queue_timeout,
                self.semaphore.clone().acquire_owned(),
            ) => match acquired {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return self.failed(call, ErrorKind::Internal, "executor shut down", started);
                }
                Err(_) => {
                    return self.failed(
                        call,
                        ErrorKind::QueuedTimeout,
                        format!(
                            "tool '{}' waited longer than {:?} for a worker",
                            call.name, self.config.queue_timeout
                        ),
                        started,
                    );
                }
            }
        };
        let _permit = permit;

        let Some(tool) = self.get(&call.name) else {
            return self.failed(
                call,
                ErrorKind::NotFound,
                format!("tool '{}' is not registered", call.name),
                started,
            );
        };

        let execution = tokio::select! {
            _ = call_token.cancelled() => {
                return self.failed(call, ErrorKind::Aborted, "tool execution aborted", started);
            }
            result = tokio::time::timeout(
                self.config.tool_timeout,
                tool.execute(&call.call_id, call.arguments.clone(), call_token.clone()),
            ) => result,
        };

        match execution {
            Ok(Ok(content)) => {
                let (content, truncated) = self.truncate_blocks(content);
                ToolOutcome {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    content,
                    is_error: false,
                    duration: started.elapsed(),
                    truncated,
                }
            }
            Ok(Err(err)) => self.failed(call, err.kind, err.message, started),
            Err(_) => self.failed(
                call,
                ErrorKind::Timeout,
                format!(
                    "tool '{}' exceeded its {:?} timeout",
                    call.name, self.config.tool_timeout
                ),
                started,
            ),
        }
    }

    fn failed(
        &self,
        call: &ToolCall,
        kind: ErrorKind,
        message: impl Into<String>,
        started: std::time::Instant,
    ) -> ToolOutcome {
        let message = message.into();
        ToolOutcome {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            content: vec![ContentBlock::text(format!("{}: {message}", kind.as_str()))],
            is_error: true,
            duration: started.elapsed(),
            truncated: false,
        }
    }

    fn truncate_blocks(&self, blocks: Vec<ContentBlock>) -> (Vec<ContentBlock>, bool) {
        let mut truncated = false;
        let blocks = blocks
            .into_iter()
            .map(|block| match block {
                ContentBlock::Text(t) => {
                    let clamped = self.config.output.clamp(&t.text);
                    truncated |= clamped.was_clamped;
                    ContentBlock::text(clamped.text)
                }
                other => other,
            })
            .collect();
        (blocks, truncated)
    }
}
