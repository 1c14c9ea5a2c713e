use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tern_core::agent_loop::{LoopConfig, QueueMode, run_agent_loop};
use tern_core::error::ErrorKind;
use tern_core::events::AgentEvent;
use tern_core::executor::{ToolAdapter, ToolExecutor};
use tern_core::retry::{RetryPolicy, classify_llm_error};
use tern_core::stream::StreamFn;
use tern_core::types::{
    Message, Model, Role, StopReason, StreamOptions, ThinkingLevel, ToolCall,
};

use crate::compaction::compactor::{CompactionSettings, Compactor, ToolSummaryStrategy};
use crate::config::Env;
use crate::error::AgentError;
use crate::model::registry::ModelRegistry;
use crate::session::store::{CompactionOutcome, SessionStore};
use crate::session::types::SessionSummary;
use crate::settings::Settings;
use crate::trace;
use crate::trace::writer::TraceEvent;

/// How an incoming `prompt` behaves while a turn is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyMode {
    Reject,
    QueueFollowUp,
}

pub type EventListener = Box<dyn Fn(&AgentEvent) + Send + Sync>;
pub type ExporterFn =
    Arc<dyn Fn(&SessionStore, Option<&str>) -> Result<PathBuf, AgentError> + Send + Sync>;

pub struct RuntimeOptions {
    pub sessions_root: PathBuf,
    pub cwd: String,
    pub settings: Settings,
    pub env: Env,
    pub stream_fn: StreamFn,
    pub tools: Vec<Arc<dyn ToolAdapter>>,
    pub system_prompt: String,
    pub session_id: Option<String>,
    pub exporter: Option<ExporterFn>,
}

/// Mutable runtime knobs. Replaced as a whole on mutation; turn logic
/// snapshots it once at turn start.
#[derive(Clone)]
struct RuntimeState {
    model: Model,
    thinking: ThinkingLevel,
    compaction: CompactionSettings,
    retry: RetryPolicy,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,
    busy_mode: BusyMode,
    emit_deltas: bool,
    system_prompt: String,
    turn_count: u64,
}

struct RuntimeInner {
    sessions_root: PathBuf,
    cwd: String,
    store: tokio::sync::Mutex<SessionStore>,
    state: Mutex<RuntimeState>,
    steering: Mutex<Vec<Message>>,
    follow_up: Mutex<Vec<Message>>,
    busy: AtomicBool,
    turn_cancel: Mutex<CancellationToken>,
    retry_cancel: Mutex<CancellationToken>,
    executor: Arc<ToolExecutor>,
    stream_fn: StreamFn,
    env: Env,
    registry: ModelRegistry,
    listeners: Mutex<Vec<EventListener>>,
    exporter: Option<ExporterFn>,
    llm_span_start: Mutex<Option<std::time::Instant>>,
}

/// The façade front-ends drive: owns the current session, the agent
/// loop, compaction, and event fan-out. Cheap to clone.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub fn new(options: RuntimeOptions) -> Result<Self, AgentError> {
        let registry = ModelRegistry::new();
        let model = options
            .env
            .model
            .as_deref()
            .and_then(|pattern| registry.find(pattern))
            .unwrap_or_else(|| registry.default_model())
            .clone();

        let store = match &options.session_id {
            Some(id) if SessionStore::exists(&options.sessions_root, id) => {
                SessionStore::open(&options.sessions_root, id)?
            }
            Some(id) => SessionStore::create(&options.sessions_root, id, &options.cwd)?,
            None => SessionStore::create(
                &options.sessions_root,
                &SessionStore::new_session_id(),
                &options.cwd,
            )?,
        };

        let executor = Arc::new(ToolExecutor::new(options.settings.executor_config()));
        for tool in &options.tools {
            executor.register(tool.clone());
        }

        let state = RuntimeState {
            model,
            thinking: ThinkingLevel::Off,
            compaction: options.settings.compaction.clone(),
            retry: RetryPolicy::default(),
            steering_mode: QueueMode::OneAtATime,
            follow_up_mode: QueueMode::OneAtATime,
            busy_mode: BusyMode::Reject,
            emit_deltas: options.env.stream_verbose,
            system_prompt: options.system_prompt,
            turn_count: 0,
        };

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                sessions_root: options.sessions_root,
                cwd: options.cwd,
                store: tokio::sync::Mutex::new(store),
                state: Mutex::new(state),
                steering: Mutex::new(Vec::new()),
                follow_up: Mutex::new(Vec::new()),
                busy: AtomicBool::new(false),
                turn_cancel: Mutex::new(CancellationToken::new()),
                retry_cancel: Mutex::new(CancellationToken::new()),
                executor,
                stream_fn: options.stream_fn,
                env: options.env,
                registry,
                listeners: Mutex::new(Vec::new()),
                exporter: options.exporter,
                llm_span_start: Mutex::new(None),
            }),
        })
    }

    // ---------- Events ----------

    pub fn subscribe(&self, listener: EventListener) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    fn emit(&self, event: &AgentEvent) {
        // The listener lock serializes delivery, preserving event order.
        let listeners = self.inner.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(event);
        }
        drop(listeners);
        self.record_trace(event);
    }

    fn record_trace(&self, event: &AgentEvent) {
        match event {
            AgentEvent::MessageStart { message } if message.role == Role::Assistant => {
                *self.inner.llm_span_start.lock().unwrap() = Some(std::time::Instant::now());
                trace::buffer::record(TraceEvent::begin("llm_call", "llm", "llm"));
            }
            AgentEvent::MessageEnd { message } if message.role == Role::Assistant => {
                let started = self.inner.llm_span_start.lock().unwrap().take();
                let duration_us = started.map(|s| s.elapsed().as_micros() as u64).unwrap_or(0);
                trace::buffer::record(TraceEvent::end(
                    "llm_call",
                    "llm",
                    "llm",
                    duration_us,
                    Some(json!({ "stop_reason": message.stop_reason.map(|r| r.to_string()) })),
                ));
            }
            AgentEvent::ToolExecutionStart { call_id, name, .. } => {
                trace::buffer::record(TraceEvent::begin(format!("tool:{name}"), "tool", call_id));
            }
            AgentEvent::ToolExecutionEnd {
                call_id,
                name,
                is_error,
                duration_ms,
                truncated,
            } => {
                trace::buffer::record(TraceEvent::end(
                    format!("tool:{name}"),
                    "tool",
                    call_id,
                    duration_ms * 1000,
                    Some(json!({ "is_error": is_error, "truncated": truncated })),
                ));
            }
            AgentEvent::TurnStart => {
                trace::buffer::record(TraceEvent::instant("turn_start", "agent", None));
            }
            AgentEvent::TurnEnd => {
                trace::buffer::record(TraceEvent::instant("turn_end", "agent", None));
            }
            AgentEvent::CompactionEnd {
                tokens_before,
                tokens_after,
            } => {
                trace::buffer::record(TraceEvent::instant(
                    "compaction",
                    "agent",
                    Some(json!({ "tokens_before": tokens_before, "tokens_after": tokens_after })),
                ));
            }
            _ => {}
        }
    }

    // ---------- Introspection ----------

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub async fn session_id(&self) -> String {
        self.inner.store.lock().await.id().to_string()
    }

    pub async fn get_messages(&self) -> Vec<Message> {
        self.inner.store.lock().await.get_messages()
    }

    pub async fn get_fork_messages(&self, leaf_id: &str) -> Result<Vec<Message>, AgentError> {
        self.inner.store.lock().await.get_messages_at(leaf_id)
    }

    pub async fn get_last_assistant_text(&self) -> Option<String> {
        self.inner
            .store
            .lock()
            .await
            .get_messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text())
    }

    pub async fn get_state(&self) -> Value {
        let store = self.inner.store.lock().await;
        let state = self.inner.state.lock().unwrap().clone();
        let (name, title) = store.info();
        json!({
            "session_id": store.id(),
            "session_name": name,
            "session_title": title,
            "cwd": self.inner.cwd,
            "model": state.model.id,
            "thinking_level": state.thinking.to_string(),
            "busy": self.is_busy(),
            "auto_compact": state.compaction.auto_compact,
            "entry_count": store.entries().len(),
            "turn_count": state.turn_count,
        })
    }

    pub async fn get_session_stats(&self) -> Value {
        let store = self.inner.store.lock().await;
        let state = self.inner.state.lock().unwrap().clone();
        let messages = store.get_messages();
        let compactor = Compactor::new(
            state.compaction.clone(),
            state.model.context_window,
            &state.system_prompt,
        );
        let tokens = compactor.estimate_context_tokens(&messages);
        let percent = if state.model.context_window > 0 {
            Some(tokens as f64 / state.model.context_window as f64 * 100.0)
        } else {
            None
        };
        json!({
            "session_id": store.id(),
            "entry_count": store.entries().len(),
            "message_count": messages.len(),
            "estimated_tokens": tokens,
            "context_window": state.model.context_window,
            "context_percent": percent,
        })
    }

    pub async fn get_tree(&self) -> Value {
        let store = self.inner.store.lock().await;
        let entries: Vec<Value> = store
            .entries()
            .iter()
            .map(|e| {
                json!({
                    "id": e.id(),
                    "parent_id": e.parent_id(),
                    "type": e.entry_type(),
                    "timestamp": e.timestamp(),
                })
            })
            .collect();
        json!({
            "leaf": store.leaf(),
            "entries": entries,
        })
    }

    // ---------- Model and thinking control ----------

    pub fn get_available_models(&self) -> Vec<Model> {
        self.inner.registry.all().to_vec()
    }

    pub fn set_model(&self, pattern: &str) -> Result<Model, AgentError> {
        let model = self
            .inner
            .registry
            .find(pattern)
            .cloned()
            .ok_or_else(|| AgentError::not_found(format!("model not found: {pattern}")))?;
        self.inner.state.lock().unwrap().model = model.clone();
        Ok(model)
    }

    pub fn cycle_model(&self) -> Model {
        let mut state = self.inner.state.lock().unwrap();
        let next = self.inner.registry.next_after(&state.model.id).clone();
        state.model = next.clone();
        next
    }

    pub fn set_thinking_level(&self, level: &str) -> Result<ThinkingLevel, AgentError> {
        let parsed = ThinkingLevel::parse(level)
            .ok_or_else(|| AgentError::validation(format!("unknown thinking level: {level}")))?;
        self.inner.state.lock().unwrap().thinking = parsed;
        Ok(parsed)
    }

    pub fn cycle_thinking_level(&self) -> ThinkingLevel {
        let mut state = self.inner.state.lock().unwrap();
        state.thinking = state.thinking.next();
        state.thinking
    }

    // ---------- Queue and retry modes ----------

    pub fn set_steering_mode(&self, mode: &str) -> Result<(), AgentError> {
        let mode = QueueMode::parse(mode)
            .ok_or_else(|| AgentError::validation(format!("unknown steering mode: {mode}")))?;
        self.inner.state.lock().unwrap().steering_mode = mode;
        Ok(())
    }

    pub fn set_follow_up_mode(&self, mode: &str) -> Result<(), AgentError> {
        let mode = QueueMode::parse(mode)
            .ok_or_else(|| AgentError::validation(format!("unknown follow-up mode: {mode}")))?;
        self.inner.state.lock().unwrap().follow_up_mode = mode;
        Ok(())
    }

    pub fn set_auto_retry(&self, enabled: bool, max_retries: Option<u32>) {
        let mut state = self.inner.state.lock().unwrap();
        state.retry.enabled = enabled;
        if let Some(max) = max_retries {
            state.retry.limit = max;
        }
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.inner.state.lock().unwrap().retry = policy;
    }

    // ---------- Compaction control ----------

    pub fn set_auto_compaction(&self, enabled: bool) {
        let mut state = self.inner.state.lock().unwrap();
        let mut compaction = state.compaction.clone();
        compaction.auto_compact = enabled;
        state.compaction = compaction;
    }

    pub fn set_tool_call_cutoff(&self, cutoff: usize) {
        let mut state = self.inner.state.lock().unwrap();
        let mut compaction = state.compaction.clone();
        compaction.tool_call_cutoff = cutoff;
        state.compaction = compaction;
    }

    pub fn set_tool_summary_strategy(&self, strategy: &str) -> Result<(), AgentError> {
        let parsed = ToolSummaryStrategy::parse(strategy).ok_or_else(|| {
            AgentError::validation(format!("unknown tool summary strategy: {strategy}"))
        })?;
        let mut state = self.inner.state.lock().unwrap();
        let mut compaction = state.compaction.clone();
        compaction.tool_summary_strategy = parsed;
        state.compaction = compaction;
        Ok(())
    }

    fn compactor(&self, state: &RuntimeState) -> Compactor {
        Compactor::new(
            state.compaction.clone(),
            state.model.context_window,
            &state.system_prompt,
        )
    }

    fn stream_options(&self, state: &RuntimeState, session_id: String) -> StreamOptions {
        StreamOptions {
            api_key: self.inner.env.api_key.clone(),
            base_url: self.inner.env.base_url.clone(),
            thinking: (state.thinking != ThinkingLevel::Off).then_some(state.thinking),
            max_tokens: Some(state.model.max_tokens),
            session_id: Some(session_id),
        }
    }

    /// Manual compaction of the current session.
    pub async fn compact(&self) -> Result<CompactionOutcome, AgentError> {
        if self.is_busy() {
            return Err(AgentError::busy("cannot compact while a turn is running"));
        }
        let state = self.inner.state.lock().unwrap().clone();
        let mut store = self.inner.store.lock().await;
        let session_id = store.id().to_string();
        let compactor = self.compactor(&state);

        self.emit(&AgentEvent::CompactionStart);
        let result = compactor
            .compact_session(
                &mut store,
                &self.inner.stream_fn,
                &state.model,
                &self.stream_options(&state, session_id),
            )
            .await;
        match &result {
            Ok(outcome) => self.emit(&AgentEvent::CompactionEnd {
                tokens_before: outcome.tokens_before,
                tokens_after: outcome.tokens_after,
            }),
            Err(e) => self.emit(&AgentEvent::Error {
                kind: e.kind,
                message: e.message.clone(),
            }),
        }
        result
    }

    // ---------- Session lifecycle ----------

    fn ensure_idle(&self, what: &str) -> Result<(), AgentError> {
        if self.is_busy() {
            return Err(AgentError::busy(format!(
                "cannot {what} while a turn is running"
            )));
        }
        Ok(())
    }

    pub async fn new_session(&self) -> Result<String, AgentError> {
        self.ensure_idle("switch sessions")?;
        let store = SessionStore::create(
            &self.inner.sessions_root,
            &SessionStore::new_session_id(),
            &self.inner.cwd,
        )?;
        let id = store.id().to_string();
        *self.inner.store.lock().await = store;
        self.inner.state.lock().unwrap().turn_count = 0;
        Ok(id)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, AgentError> {
        SessionStore::list(&self.inner.sessions_root)
    }

    pub async fn switch_session(&self, id: &str) -> Result<(), AgentError> {
        self.ensure_idle("switch sessions")?;
        let store = SessionStore::open(&self.inner.sessions_root, id)?;
        *self.inner.store.lock().await = store;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), AgentError> {
        let current = self.session_id().await;
        if current == id {
            return Err(AgentError::validation(
                "cannot delete the active session; switch away first",
            ));
        }
        SessionStore::delete(&self.inner.sessions_root, id)
    }

    /// Start over: the old journal stays on disk, a fresh session
    /// becomes current.
    pub async fn clear_session(&self) -> Result<String, AgentError> {
        self.new_session().await
    }

    pub async fn set_session_name(&self, name: Option<String>, title: Option<String>) -> Result<(), AgentError> {
        self.ensure_idle("rename the session")?;
        self.inner
            .store
            .lock()
            .await
            .append_session_info(name, title)?;
        Ok(())
    }

    pub async fn fork(
        &self,
        leaf_id: Option<&str>,
        name: Option<String>,
        title: Option<String>,
    ) -> Result<String, AgentError> {
        self.ensure_idle("fork")?;
        let mut store = self.inner.store.lock().await;
        let forked = store.fork_from(&self.inner.sessions_root, leaf_id, name, title)?;
        let id = forked.id().to_string();
        *store = forked;
        Ok(id)
    }

    pub async fn resume_on_branch(&self, entry_id: &str) -> Result<(), AgentError> {
        self.ensure_idle("move the branch pointer")?;
        self.inner.store.lock().await.branch_to(entry_id)
    }

    pub fn export_html(&self, output: Option<&str>) -> Result<PathBuf, AgentError> {
        let Some(exporter) = &self.inner.exporter else {
            return Err(AgentError::validation(
                "no HTML exporter is configured in this build",
            ));
        };
        // The exporter borrows the store synchronously; it must not be
        // called mid-turn.
        self.ensure_idle("export")?;
        let store = self.inner.store.try_lock().map_err(|_| {
            AgentError::busy("session store is in use")
        })?;
        exporter(&store, output)
    }

    // ---------- Steering, follow-up, abort ----------

    pub fn steer(&self, text: &str) -> Result<(), AgentError> {
        if !self.is_busy() {
            return Err(AgentError::validation(
                "no turn in progress; use prompt instead",
            ));
        }
        let message = Message::user(text).with_kind("steering");
        self.inner.steering.lock().unwrap().push(message);
        Ok(())
    }

    pub fn follow_up(&self, text: &str) -> Result<(), AgentError> {
        if !self.is_busy() {
            return Err(AgentError::validation(
                "no turn in progress; use prompt instead",
            ));
        }
        self.inner
            .follow_up
            .lock()
            .unwrap()
            .push(Message::user(text));
        Ok(())
    }

    pub fn abort(&self) {
        self.inner.turn_cancel.lock().unwrap().cancel();
        // Aborting the turn also ends any pending retry wait.
        self.inner.retry_cancel.lock().unwrap().cancel();
    }

    pub fn abort_retry(&self) {
        self.inner.retry_cancel.lock().unwrap().cancel();
    }

    pub fn abort_bash(&self) {
        self.inner.executor.abort_named("bash");
    }

    /// Run a registered `bash` tool directly, outside any turn.
    pub async fn run_bash(&self, command: &str) -> Result<Value, AgentError> {
        if self.inner.executor.get("bash").is_none() {
            return Err(AgentError::not_found("no bash tool is registered"));
        }
        let call = ToolCall {
            call_id: format!("bash-{}", uuid::Uuid::new_v4().simple()),
            name: "bash".to_string(),
            arguments: json!({ "command": command }),
        };
        let outcomes = self
            .inner
            .executor
            .dispatch(
                vec![call],
                CancellationToken::new(),
                tern_core::events::null_sink(),
            )
            .await;
        let outcome = outcomes.into_iter().next().ok_or_else(|| {
            AgentError::internal("bash execution produced no outcome")
        })?;
        let text: String = outcome
            .content
            .iter()
            .filter_map(|b| b.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");
        if outcome.is_error {
            return Err(AgentError::new(ErrorKind::Internal, text));
        }
        Ok(json!({ "output": text, "duration_ms": outcome.duration.as_millis() as u64 }))
    }

    // ---------- Prompt ----------

    /// Queue a user prompt. Returns immediately with a receiver that
    /// resolves when the turn (including retries and auto-compaction)
    /// completes.
    pub async fn prompt(
        &self,
        text: &str,
    ) -> Result<tokio::sync::oneshot::Receiver<Result<(), AgentError>>, AgentError> {
        if text.trim().is_empty() {
            return Err(AgentError::validation("prompt message is empty"));
        }
        if self.inner.busy.swap(true, Ordering::SeqCst) {
            let busy_mode = self.inner.state.lock().unwrap().busy_mode;
            match busy_mode {
                BusyMode::Reject => {
                    return Err(AgentError::busy(
                        "agent is already processing a prompt; use steer or follow_up",
                    ));
                }
                BusyMode::QueueFollowUp => {
                    self.inner
                        .follow_up
                        .lock()
                        .unwrap()
                        .push(Message::user(text));
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    let _ = tx.send(Ok(()));
                    return Ok(rx);
                }
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let runtime = self.clone();
        let prompt = Message::user(text);
        tokio::spawn(async move {
            let result = runtime.run_turn(vec![prompt]).await;
            runtime.inner.busy.store(false, Ordering::SeqCst);
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    fn drain_queue(queue: &Mutex<Vec<Message>>, mode: QueueMode) -> Vec<Message> {
        let mut queue = queue.lock().unwrap();
        match mode {
            QueueMode::OneAtATime => {
                if queue.is_empty() {
                    Vec::new()
                } else {
                    vec![queue.remove(0)]
                }
            }
            QueueMode::All => queue.drain(..).collect(),
        }
    }

    async fn run_turn(&self, prompts: Vec<Message>) -> Result<(), AgentError> {
        let state = self.inner.state.lock().unwrap().clone();
        {
            let mut s = self.inner.state.lock().unwrap();
            s.turn_count += 1;
        }

        let turn_cancel = CancellationToken::new();
        *self.inner.turn_cancel.lock().unwrap() = turn_cancel.clone();
        let retry_cancel = CancellationToken::new();
        *self.inner.retry_cancel.lock().unwrap() = retry_cancel.clone();

        let session_id = self.session_id().await;
        let options = self.stream_options(&state, session_id);

        let steering_mode = state.steering_mode;
        let follow_up_mode = state.follow_up_mode;

        let mut attempt: u32 = 0;
        let mut compacted_for_overflow = false;

        loop {
            let context = self.inner.store.lock().await.get_messages();

            let get_steering: Arc<tern_core::agent_loop::MessageQueueFn> = {
                let runtime = self.clone();
                Arc::new(move || {
                    let runtime = runtime.clone();
                    Box::pin(async move {
                        Self::drain_queue(&runtime.inner.steering, steering_mode)
                    })
                })
            };
            let get_follow_up: Arc<tern_core::agent_loop::MessageQueueFn> = {
                let runtime = self.clone();
                Arc::new(move || {
                    let runtime = runtime.clone();
                    Box::pin(async move {
                        Self::drain_queue(&runtime.inner.follow_up, follow_up_mode)
                    })
                })
            };

            let config = LoopConfig {
                model: state.model.clone(),
                system_prompt: (!state.system_prompt.is_empty())
                    .then(|| state.system_prompt.clone()),
                options: options.clone(),
                get_steering: Some(get_steering),
                get_follow_up: Some(get_follow_up),
                emit_deltas: state.emit_deltas,
            };

            let stream = run_agent_loop(
                prompts.clone(),
                context,
                self.inner.executor.specs(),
                self.inner.executor.clone(),
                config,
                turn_cancel.clone(),
                self.inner.stream_fn.clone(),
            );

            let mut pinned = Box::pin(stream.clone());
            while let Some(event) = pinned.next().await {
                self.emit(&event);
            }

            let mut outcome = stream.result().await.unwrap_or_default();

            if let Some(raw_error) = outcome.llm_error.take() {
                let kind = classify_llm_error(&raw_error);
                match kind {
                    ErrorKind::ContextLengthExceeded if !compacted_for_overflow => {
                        compacted_for_overflow = true;
                        let compactor = self.compactor(&state);
                        let mut store = self.inner.store.lock().await;
                        self.emit(&AgentEvent::CompactionStart);
                        match compactor
                            .compact_session(
                                &mut store,
                                &self.inner.stream_fn,
                                &state.model,
                                &options,
                            )
                            .await
                        {
                            Ok(result) => {
                                self.emit(&AgentEvent::CompactionEnd {
                                    tokens_before: result.tokens_before,
                                    tokens_after: result.tokens_after,
                                });
                                continue;
                            }
                            Err(e) => {
                                drop(store);
                                let err = AgentError::new(
                                    ErrorKind::LlmPermanent,
                                    format!("{raw_error} (compaction failed: {})", e.message),
                                );
                                self.finish_with_error(outcome.messages, err.clone()).await;
                                return Err(err);
                            }
                        }
                    }
                    ErrorKind::LlmTransient
                        if state.retry.enabled
                            && attempt < state.retry.limit
                            && !retry_cancel.is_cancelled() =>
                    {
                        attempt += 1;
                        let delay = state.retry.delay_for(attempt);
                        self.emit(&AgentEvent::RetryScheduled {
                            attempt,
                            max_attempts: state.retry.limit,
                            delay_ms: delay.as_millis() as u64,
                            error: raw_error.clone(),
                        });
                        tokio::select! {
                            _ = retry_cancel.cancelled() => {
                                self.emit(&AgentEvent::RetryAborted { attempt });
                                let err = AgentError::aborted("retry chain aborted");
                                self.finish_with_error(outcome.messages, err.clone()).await;
                                return Err(err);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        // Failed-attempt messages are discarded; the next
                        // attempt re-runs from the persisted context.
                        continue;
                    }
                    ErrorKind::LlmTransient => {
                        self.emit(&AgentEvent::RetryExhausted {
                            attempts: attempt,
                            error: raw_error.clone(),
                        });
                        let err = AgentError::new(ErrorKind::LlmTransient, raw_error.clone());
                        self.finish_with_error(outcome.messages, err.clone()).await;
                        return Err(err);
                    }
                    _ => {
                        let err = AgentError::new(
                            if kind == ErrorKind::ContextLengthExceeded {
                                ErrorKind::LlmPermanent
                            } else {
                                kind
                            },
                            raw_error.clone(),
                        );
                        self.finish_with_error(outcome.messages, err.clone()).await;
                        return Err(err);
                    }
                }
            }

            // Success or abort: persist everything the run produced.
            self.persist_messages(&outcome.messages).await;

            let aborted = outcome
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .is_some_and(|m| m.stop_reason == Some(StopReason::Aborted));

            if !aborted {
                self.auto_compact_if_needed(&state, &options).await;
            }

            return Ok(());
        }
    }

    async fn finish_with_error(&self, messages: Vec<Message>, err: AgentError) {
        // Keep the failed turn in the journal so the failure is auditable.
        self.persist_messages(&messages).await;
        self.emit(&AgentEvent::Error {
            kind: err.kind,
            message: err.message.clone(),
        });
    }

    async fn persist_messages(&self, messages: &[Message]) {
        let mut store = self.inner.store.lock().await;
        for message in messages {
            if let Err(e) = store.append_message(message.clone()) {
                tracing::warn!("failed to persist message: {e}");
                self.emit(&AgentEvent::Error {
                    kind: e.kind,
                    message: e.message,
                });
                break;
            }
        }
    }

    async fn auto_compact_if_needed(&self, state: &RuntimeState, options: &StreamOptions) {
        let compactor = self.compactor(state);
        let should = {
            let store = self.inner.store.lock().await;
            compactor.should_compact(&store.get_messages())
        };
        if !should {
            return;
        }

        let mut store = self.inner.store.lock().await;
        self.emit(&AgentEvent::CompactionStart);
        match compactor
            .compact_session(&mut store, &self.inner.stream_fn, &state.model, options)
            .await
        {
            Ok(outcome) => self.emit(&AgentEvent::CompactionEnd {
                tokens_before: outcome.tokens_before,
                tokens_after: outcome.tokens_after,
            }),
            Err(e) => {
                tracing::warn!("auto-compaction failed: {e}");
                self.emit(&AgentEvent::Error {
                    kind: e.kind,
                    message: e.message,
                });
            }
        }
    }
}
