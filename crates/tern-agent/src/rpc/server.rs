use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::AgentError;
use crate::rpc::commands::{KNOWN_COMMANDS, RpcRequest, RpcResponse};
use crate::runtime::session::AgentRuntime;
use crate::trace;

/// Shared line writer: one JSON record per line, flushed per record, no
/// interleaving inside a record.
#[derive(Clone)]
pub struct LineWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LineWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn write_value(&self, value: &Value) {
        let mut writer = self.inner.lock().unwrap();
        if let Err(e) = writeln!(writer, "{value}") {
            tracing::warn!("rpc write failed: {e}");
            return;
        }
        let _ = writer.flush();
    }

    pub fn write_response(&self, response: &RpcResponse) {
        match serde_json::to_value(response) {
            Ok(value) => self.write_value(&value),
            Err(e) => tracing::error!("response serialization failed: {e}"),
        }
    }
}

/// What a handler produced: an immediate result, or a promise that the
/// handler will write the response itself once background work is done.
pub enum Reply {
    Now(Result<Option<Value>, AgentError>),
    Later,
}

pub type Handler =
    Arc<dyn Fn(RpcRequest, AgentRuntime, LineWriter) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Line-JSON command server: reads commands, dispatches to registered
/// handlers, and multiplexes responses with runtime events on one
/// output stream.
pub struct RpcServer {
    runtime: AgentRuntime,
    writer: LineWriter,
    handlers: Mutex<HashMap<String, Handler>>,
}

impl RpcServer {
    pub fn new(runtime: AgentRuntime, writer: LineWriter) -> Arc<Self> {
        let server = Arc::new(Self {
            runtime,
            writer,
            handlers: Mutex::new(HashMap::new()),
        });
        server.register_defaults();
        server
    }

    pub fn register(&self, command: &str, handler: Handler) {
        self.handlers
            .lock()
            .unwrap()
            .insert(command.to_string(), handler);
    }

    pub fn unregister(&self, command: &str) {
        self.handlers.lock().unwrap().remove(command);
    }

    fn register_defaults(self: &Arc<Self>) {
        for command in KNOWN_COMMANDS {
            let handler: Handler = Arc::new(move |req, runtime, writer| {
                Box::pin(builtin_handler(req, runtime, writer))
            });
            self.register(command, handler);
        }
    }

    /// Wire runtime events and the trace overflow marker into the
    /// output stream, then consume command lines until EOF.
    pub async fn serve<R: AsyncRead + Unpin>(self: Arc<Self>, reader: R) {
        let event_writer = self.writer.clone();
        self.runtime.subscribe(Box::new(move |event| {
            event_writer.write_value(&event.to_wire());
        }));

        if let Some(buffer) = trace::buffer::active() {
            let overflow_writer = self.writer.clone();
            buffer.set_overflow_hook(Arc::new(move |dropped| {
                overflow_writer.write_value(&json!({
                    "type": "trace_overflow",
                    "dropped": dropped,
                }));
            }));
        }

        self.writer.write_value(&json!({
            "type": "server_start",
            "version": crate::config::VERSION,
        }));

        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.dispatch_line(&line).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("rpc read failed: {e}");
                    break;
                }
            }
        }
    }

    /// Parse and dispatch one line. A handler failure is reported as an
    /// error response; the server keeps serving.
    pub async fn dispatch_line(&self, line: &str) {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                self.writer.write_response(&RpcResponse::fail_text(
                    None,
                    "unknown",
                    format!("malformed command: {e}"),
                ));
                return;
            }
        };

        // Fetch the handler under the registry lock, then release it
        // before any handler work runs.
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(&request.command).cloned()
        };

        let Some(handler) = handler else {
            let error = if KNOWN_COMMANDS.contains(&request.command.as_str()) {
                format!("no handler registered for command: {}", request.command)
            } else {
                format!("unknown command: {}", request.command)
            };
            self.writer.write_response(&RpcResponse::fail_text(
                request.id.clone(),
                request.command.clone(),
                error,
            ));
            return;
        };

        let id = request.id.clone();
        let command = request.command.clone();
        match handler(request, self.runtime.clone(), self.writer.clone()).await {
            Reply::Now(Ok(data)) => {
                self.writer
                    .write_response(&RpcResponse::ok(id, command, data));
            }
            Reply::Now(Err(e)) => {
                self.writer
                    .write_response(&RpcResponse::fail(id, command, &e));
            }
            Reply::Later => {}
        }
    }
}

fn require_text(req: &RpcRequest) -> Result<String, AgentError> {
    req.message_text()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AgentError::validation(format!("command '{}' requires a message", req.command)))
}

/// The built-in behavior for every command in the taxonomy.
async fn builtin_handler(req: RpcRequest, runtime: AgentRuntime, writer: LineWriter) -> Reply {
    let id = req.id.clone();
    let command = req.command.clone();

    match command.as_str() {
        "ping" => Reply::Now(Ok(Some(json!("pong")))),

        "prompt" => {
            let text = match require_text(&req) {
                Ok(text) => text,
                Err(e) => return Reply::Now(Err(e)),
            };
            match runtime.prompt(&text).await {
                Ok(done) => {
                    // The response follows the turn's final event.
                    let (id, command) = (id.clone(), command.clone());
                    tokio::spawn(async move {
                        let result = done.await.unwrap_or_else(|_| {
                            Err(AgentError::internal("turn task dropped its completion channel"))
                        });
                        match result {
                            Ok(()) => writer.write_response(&RpcResponse::ok(id, command, None)),
                            Err(e) => {
                                writer.write_response(&RpcResponse::fail(id, command, &e))
                            }
                        }
                    });
                    Reply::Later
                }
                Err(e) => Reply::Now(Err(e)),
            }
        }

        "steer" => Reply::Now(require_text(&req).and_then(|t| runtime.steer(&t)).map(|_| None)),
        "follow_up" => Reply::Now(
            require_text(&req)
                .and_then(|t| runtime.follow_up(&t))
                .map(|_| None),
        ),

        "abort" => {
            runtime.abort();
            Reply::Now(Ok(None))
        }
        "abort_retry" => {
            runtime.abort_retry();
            Reply::Now(Ok(None))
        }
        "abort_bash" => {
            runtime.abort_bash();
            Reply::Now(Ok(None))
        }

        "new_session" => Reply::Now(
            runtime
                .new_session()
                .await
                .map(|session_id| Some(json!({ "session_id": session_id }))),
        ),
        "clear_session" => Reply::Now(
            runtime
                .clear_session()
                .await
                .map(|session_id| Some(json!({ "session_id": session_id }))),
        ),
        "list_sessions" => Reply::Now(
            runtime
                .list_sessions()
                .and_then(|sessions| Ok(Some(serde_json::to_value(sessions)?))),
        ),
        "switch_session" => {
            let Some(session_id) = req.data_str("session_id") else {
                return Reply::Now(Err(AgentError::validation("missing data.session_id")));
            };
            Reply::Now(runtime.switch_session(&session_id).await.map(|_| None))
        }
        "delete_session" => {
            let Some(session_id) = req.data_str("session_id") else {
                return Reply::Now(Err(AgentError::validation("missing data.session_id")));
            };
            Reply::Now(runtime.delete_session(&session_id).await.map(|_| None))
        }
        "set_session_name" => {
            let name = req.message_text().or_else(|| req.data_str("name"));
            let title = req.data_str("title");
            Reply::Now(runtime.set_session_name(name, title).await.map(|_| None))
        }

        "get_state" => Reply::Now(Ok(Some(runtime.get_state().await))),
        "get_messages" => Reply::Now(
            serde_json::to_value(runtime.get_messages().await)
                .map(Some)
                .map_err(AgentError::from),
        ),
        "get_session_stats" => Reply::Now(Ok(Some(runtime.get_session_stats().await))),
        "get_last_assistant_text" => Reply::Now(Ok(Some(
            json!({ "text": runtime.get_last_assistant_text().await }),
        ))),
        "get_fork_messages" => {
            let Some(entry_id) = req.data_str("entry_id") else {
                return Reply::Now(Err(AgentError::validation("missing data.entry_id")));
            };
            Reply::Now(
                runtime
                    .get_fork_messages(&entry_id)
                    .await
                    .and_then(|messages| Ok(Some(serde_json::to_value(messages)?))),
            )
        }
        "get_tree" => Reply::Now(Ok(Some(runtime.get_tree().await))),

        "fork" => {
            let leaf = req.data_str("entry_id");
            let name = req.data_str("name");
            let title = req.data_str("title");
            Reply::Now(
                runtime
                    .fork(leaf.as_deref(), name, title)
                    .await
                    .map(|session_id| Some(json!({ "session_id": session_id }))),
            )
        }
        "resume_on_branch" => {
            let Some(entry_id) = req.data_str("entry_id") else {
                return Reply::Now(Err(AgentError::validation("missing data.entry_id")));
            };
            Reply::Now(runtime.resume_on_branch(&entry_id).await.map(|_| None))
        }

        "compact" => {
            let (id, command) = (id.clone(), command.clone());
            tokio::spawn(async move {
                match runtime.compact().await {
                    Ok(outcome) => writer.write_response(&RpcResponse::ok(
                        id,
                        command,
                        serde_json::to_value(outcome).ok(),
                    )),
                    Err(e) => writer.write_response(&RpcResponse::fail(id, command, &e)),
                }
            });
            Reply::Later
        }
        "set_auto_compaction" => {
            let Some(enabled) = req.data_bool("enabled") else {
                return Reply::Now(Err(AgentError::validation("missing data.enabled")));
            };
            runtime.set_auto_compaction(enabled);
            Reply::Now(Ok(None))
        }
        "set_tool_call_cutoff" => {
            let Some(cutoff) = req.data_u64("cutoff") else {
                return Reply::Now(Err(AgentError::validation("missing data.cutoff")));
            };
            runtime.set_tool_call_cutoff(cutoff as usize);
            Reply::Now(Ok(None))
        }
        "set_tool_summary_strategy" => {
            let Some(strategy) = req.data_str("strategy").or_else(|| req.message_text()) else {
                return Reply::Now(Err(AgentError::validation("missing data.strategy")));
            };
            Reply::Now(runtime.set_tool_summary_strategy(&strategy).map(|_| None))
        }

        "get_available_models" => Reply::Now(
            serde_json::to_value(runtime.get_available_models())
                .map(Some)
                .map_err(AgentError::from),
        ),
        "set_model" => {
            let Some(pattern) = req.data_str("model").or_else(|| req.message_text()) else {
                return Reply::Now(Err(AgentError::validation("missing data.model")));
            };
            Reply::Now(
                runtime
                    .set_model(&pattern)
                    .map(|model| Some(json!({ "model": model.id }))),
            )
        }
        "cycle_model" => {
            let model = runtime.cycle_model();
            Reply::Now(Ok(Some(json!({ "model": model.id }))))
        }
        "set_thinking_level" => {
            let Some(level) = req.data_str("level").or_else(|| req.message_text()) else {
                return Reply::Now(Err(AgentError::validation("missing data.level")));
            };
            Reply::Now(
                runtime
                    .set_thinking_level(&level)
                    .map(|level| Some(json!({ "thinking_level": level.to_string() }))),
            )
        }
        "cycle_thinking_level" => {
            let level = runtime.cycle_thinking_level();
            Reply::Now(Ok(Some(json!({ "thinking_level": level.to_string() }))))
        }

        "get_commands" => Reply::Now(Ok(Some(json!(KNOWN_COMMANDS)))),
        "set_steering_mode" => {
            let Some(mode) = req.data_str("mode").or_else(|| req.message_text()) else {
                return Reply::Now(Err(AgentError::validation("missing data.mode")));
            };
            Reply::Now(runtime.set_steering_mode(&mode).map(|_| None))
        }
        "set_follow_up_mode" => {
            let Some(mode) = req.data_str("mode").or_else(|| req.message_text()) else {
                return Reply::Now(Err(AgentError::validation("missing data.mode")));
            };
            Reply::Now(runtime.set_follow_up_mode(&mode).map(|_| None))
        }
        "set_auto_retry" => {
            let Some(enabled) = req.data_bool("enabled") else {
                return Reply::Now(Err(AgentError::validation("missing data.enabled")));
            };
            runtime.set_auto_retry(enabled, req.data_u64("max_retries").map(|v| v as u32));
            Reply::Now(Ok(None))
        }
        "export_html" => {
            let output = req.data_str("path");
            Reply::Now(
                runtime
                    .export_html(output.as_deref())
                    .map(|path| Some(json!({ "path": path.display().to_string() }))),
            )
        }
        "bash" => {
            let text = match require_text(&req) {
                Ok(text) => text,
                Err(e) => return Reply::Now(Err(e)),
            };
            let (id, command) = (id.clone(), command.clone());
            tokio::spawn(async move {
                match runtime.run_bash(&text).await {
                    Ok(data) => {
                        writer.write_response(&RpcResponse::ok(id, command, Some(data)))
                    }
                    Err(e) => writer.write_response(&RpcResponse::fail(id, command, &e)),
                }
            });
            Reply::Later
        }

        other => Reply::Now(Err(AgentError::validation(format!(
            "unknown command: {other}"
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Env;
    use crate::runtime::session::{AgentRuntime, RuntimeOptions};
    use crate::settings::Settings;
    use std::time::Duration;
    use tern_core::stream::{StreamFn, assistant_stream};
    use tern_core::types::{AssistantEvent, ContentBlock, Message};

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn output_lines(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<Value> {
        let raw = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).expect("each output line is JSON"))
            .collect()
    }

    async fn wait_for(
        buf: &Arc<Mutex<Vec<u8>>>,
        predicate: impl Fn(&[Value]) -> bool,
    ) -> Vec<Value> {
        for _ in 0..200 {
            let lines = output_lines(buf);
            if predicate(&lines) {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached; output: {:?}", output_lines(buf));
    }

    fn scripted_stream_fn(texts: Vec<&'static str>, delay: Duration) -> StreamFn {
        let queue = Arc::new(Mutex::new(texts));
        Arc::new(move |_model, _context, _options| {
            let stream = assistant_stream();
            let text = {
                let mut queue = queue.lock().unwrap();
                if queue.is_empty() { "" } else { queue.remove(0) }
            };
            let producer = stream.clone();
            tokio::spawn(async move {
                let message = Message::assistant(vec![ContentBlock::text(text)]);
                producer.emit(AssistantEvent::Start {
                    partial: message.clone(),
                });
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                producer.emit(AssistantEvent::TextDelta {
                    index: 0,
                    delta: text.to_string(),
                    partial: message.clone(),
                });
                producer.emit(AssistantEvent::Done {
                    message: message.clone(),
                });
                producer.finish(None);
            });
            stream
        })
    }

    struct TestServer {
        _tmp: tempfile::TempDir,
        server: Arc<RpcServer>,
        runtime: AgentRuntime,
        buf: Arc<Mutex<Vec<u8>>>,
    }

    fn test_server(texts: Vec<&'static str>, delay: Duration) -> TestServer {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = AgentRuntime::new(RuntimeOptions {
            sessions_root: tmp.path().join("sessions"),
            cwd: "/work".to_string(),
            settings: Settings::default(),
            env: Env::default(),
            stream_fn: scripted_stream_fn(texts, delay),
            tools: Vec::new(),
            system_prompt: String::new(),
            session_id: None,
            exporter: None,
        })
        .unwrap();

        let buf = Arc::new(Mutex::new(Vec::new()));
        let writer = LineWriter::new(Box::new(SharedBuf(buf.clone())));
        let server = RpcServer::new(runtime.clone(), writer);
        TestServer {
            _tmp: tmp,
            server,
            runtime,
            buf,
        }
    }

    fn response_index(lines: &[Value], id: &str) -> Option<usize> {
        lines
            .iter()
            .position(|l| l["type"] == "response" && l["id"] == id)
    }

    #[tokio::test]
    async fn minimal_prompt_scenario() {
        let t = test_server(vec!["hi there"], Duration::ZERO);
        let input = b"{\"id\":\"1\",\"type\":\"prompt\",\"message\":\"hi\"}\n" as &[u8];
        tokio::spawn(t.server.clone().serve(input));

        let lines = wait_for(&t.buf, |lines| response_index(lines, "1").is_some()).await;

        assert_eq!(lines[0]["type"], "server_start");
        let types: Vec<&str> = lines
            .iter()
            .filter_map(|l| l["type"].as_str())
            .collect();
        let expected_order = [
            "agent_start",
            "turn_start",
            "message_start",
            "text_delta",
            "message_end",
            "turn_end",
            "agent_end",
        ];
        let mut cursor = 0;
        for expected in expected_order {
            let found = types[cursor..]
                .iter()
                .position(|t| *t == expected)
                .unwrap_or_else(|| panic!("missing {expected} after position {cursor} in {types:?}"));
            cursor += found + 1;
        }

        // Response comes after the last event.
        let response_idx = response_index(&lines, "1").unwrap();
        let agent_end_idx = types.iter().position(|t| *t == "agent_end").unwrap();
        assert!(response_idx > agent_end_idx);
        let response = &lines[response_idx];
        assert_eq!(response["command"], "prompt");
        assert_eq!(response["success"], true);

        // The session holds user + assistant.
        let messages = t.runtime.get_messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "hi there");
    }

    #[tokio::test]
    async fn ping_returns_before_in_flight_prompt() {
        let t = test_server(vec!["slow answer"], Duration::from_millis(100));
        let input = b"{\"id\":\"p\",\"type\":\"prompt\",\"message\":\"go\"}\n{\"id\":\"q\",\"type\":\"ping\"}\n"
            as &[u8];
        tokio::spawn(t.server.clone().serve(input));

        let lines = wait_for(&t.buf, |lines| {
            response_index(lines, "p").is_some() && response_index(lines, "q").is_some()
        })
        .await;
        assert!(response_index(&lines, "q").unwrap() < response_index(&lines, "p").unwrap());
    }

    #[tokio::test]
    async fn abort_scenario_finalizes_with_aborted() {
        let t = test_server(vec!["never finishes"], Duration::from_secs(10));
        let input =
            b"{\"id\":\"p\",\"type\":\"prompt\",\"message\":\"spin\"}\n" as &[u8];
        tokio::spawn(t.server.clone().serve(input));

        // Let the stream start, then abort out-of-band.
        tokio::time::sleep(Duration::from_millis(30)).await;
        t.server
            .dispatch_line("{\"id\":\"a\",\"type\":\"abort\"}")
            .await;

        let lines = wait_for(&t.buf, |lines| response_index(lines, "p").is_some()).await;
        let abort_response = response_index(&lines, "a").unwrap();
        assert_eq!(lines[abort_response]["success"], true);

        let message_end = lines
            .iter()
            .filter(|l| l["type"] == "message_end")
            .last()
            .expect("message_end present");
        assert_eq!(message_end["message"]["stop_reason"], "aborted");
        assert!(!lines.iter().any(|l| l["type"] == "tool_execution_start"));
    }

    #[tokio::test]
    async fn unknown_command_and_missing_handler_are_distinct() {
        let t = test_server(vec![], Duration::ZERO);
        t.server
            .dispatch_line("{\"id\":\"1\",\"type\":\"frobnicate\"}")
            .await;
        t.server.unregister("ping");
        t.server.dispatch_line("{\"id\":\"2\",\"type\":\"ping\"}").await;

        let lines = output_lines(&t.buf);
        assert!(lines[0]["error"]
            .as_str()
            .unwrap()
            .contains("unknown command: frobnicate"));
        assert!(lines[1]["error"]
            .as_str()
            .unwrap()
            .contains("no handler registered for command: ping"));
    }

    #[tokio::test]
    async fn malformed_line_reports_and_continues() {
        let t = test_server(vec![], Duration::ZERO);
        t.server.dispatch_line("{oops").await;
        t.server.dispatch_line("{\"id\":\"2\",\"type\":\"ping\"}").await;

        let lines = output_lines(&t.buf);
        assert_eq!(lines[0]["success"], false);
        assert!(lines[0]["error"].as_str().unwrap().contains("malformed"));
        assert_eq!(lines[1]["success"], true);
        assert_eq!(lines[1]["data"], "pong");
    }

    #[tokio::test]
    async fn session_commands_over_rpc() {
        let t = test_server(vec![], Duration::ZERO);
        t.server
            .dispatch_line("{\"id\":\"1\",\"type\":\"get_state\"}")
            .await;
        t.server
            .dispatch_line("{\"id\":\"2\",\"type\":\"new_session\"}")
            .await;
        t.server
            .dispatch_line("{\"id\":\"3\",\"type\":\"list_sessions\"}")
            .await;
        t.server
            .dispatch_line("{\"id\":\"4\",\"type\":\"get_commands\"}")
            .await;

        let lines = output_lines(&t.buf);
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l["success"] == true));
        assert!(lines[0]["data"]["session_id"].is_string());
        assert_eq!(lines[2]["data"].as_array().unwrap().len(), 2);
        assert!(lines[3]["data"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "prompt"));
    }

    #[tokio::test]
    async fn steer_without_turn_is_an_error() {
        let t = test_server(vec![], Duration::ZERO);
        t.server
            .dispatch_line("{\"id\":\"1\",\"type\":\"steer\",\"message\":\"hey\"}")
            .await;
        let lines = output_lines(&t.buf);
        assert_eq!(lines[0]["success"], false);
        assert!(lines[0]["error"].as_str().unwrap().starts_with("validation"));
    }

    #[tokio::test]
    async fn model_commands_over_rpc() {
        let t = test_server(vec![], Duration::ZERO);
        t.server
            .dispatch_line("{\"id\":\"1\",\"type\":\"get_available_models\"}")
            .await;
        t.server
            .dispatch_line("{\"id\":\"2\",\"type\":\"set_model\",\"data\":{\"model\":\"haiku\"}}")
            .await;
        t.server
            .dispatch_line("{\"id\":\"3\",\"type\":\"set_thinking_level\",\"data\":{\"level\":\"high\"}}")
            .await;

        let lines = output_lines(&t.buf);
        assert!(lines[0]["data"].as_array().unwrap().len() >= 2);
        assert_eq!(lines[1]["data"]["model"], "haiku-mini");
        assert_eq!(lines[2]["data"]["thinking_level"], "high");
    }
}
