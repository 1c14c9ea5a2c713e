use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

// ---------- Role ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
    /// Synthetic messages are produced by the runtime itself (compaction
    /// summaries, archived-tool digests) rather than by a party on the wire.
    Synthetic,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::ToolResult => write!(f, "tool_result"),
            Role::Synthetic => write!(f, "synthetic"),
        }
    }
}

// ---------- StopReason ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Stop => write!(f, "stop"),
            StopReason::Length => write!(f, "length"),
            StopReason::ToolUse => write!(f, "tool_use"),
            StopReason::Error => write!(f, "error"),
            StopReason::Aborted => write!(f, "aborted"),
        }
    }
}

// ---------- Usage ----------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub total: u64,
}

impl Usage {
    pub fn context_total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

// ---------- Content blocks ----------

#[derive(Debug, Clone, PartialEq)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingContent {
    pub thinking: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultContent {
    pub call_id: String,
    pub name: String,
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(TextContent),
    Thinking(ThinkingContent),
    ToolCall(ToolCall),
    ToolResult(ToolResultContent),
    Image(ImageContent),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextContent { text: text.into() })
    }

    pub fn block_type(&self) -> &'static str {
        match self {
            ContentBlock::Text(_) => "text",
            ContentBlock::Thinking(_) => "thinking",
            ContentBlock::ToolCall(_) => "tool_call",
            ContentBlock::ToolResult(_) => "tool_result",
            ContentBlock::Image(_) => "image",
        }
    }

    pub fn as_text(&self) -> Option<&TextContent> {
        match self {
            ContentBlock::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self {
            ContentBlock::ToolCall(tc) => Some(tc),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultContent> {
        match self {
            ContentBlock::ToolResult(tr) => Some(tr),
            _ => None,
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        match self {
            ContentBlock::Text(t) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "text")?;
                map.serialize_entry("text", &t.text)?;
                map.end()
            }
            ContentBlock::Thinking(t) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "thinking")?;
                map.serialize_entry("thinking", &t.thinking)?;
                map.end()
            }
            ContentBlock::ToolCall(tc) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "tool_call")?;
                map.serialize_entry("call_id", &tc.call_id)?;
                map.serialize_entry("name", &tc.name)?;
                map.serialize_entry("arguments", &tc.arguments)?;
                map.end()
            }
            ContentBlock::ToolResult(tr) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "tool_result")?;
                map.serialize_entry("call_id", &tr.call_id)?;
                map.serialize_entry("name", &tr.name)?;
                map.serialize_entry("content", &tr.content)?;
                map.serialize_entry("is_error", &tr.is_error)?;
                map.end()
            }
            ContentBlock::Image(i) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "image")?;
                map.serialize_entry("data", &i.data)?;
                map.serialize_entry("mime_type", &i.mime_type)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("content block must be an object"))?;
        let tag = obj
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("content block missing 'type'"))?;

        match tag {
            "text" => Ok(ContentBlock::Text(TextContent {
                text: obj
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })),
            "thinking" => Ok(ContentBlock::Thinking(ThinkingContent {
                thinking: obj
                    .get("thinking")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })),
            "tool_call" => Ok(ContentBlock::ToolCall(ToolCall {
                call_id: obj
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                name: obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                arguments: obj
                    .get("arguments")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default())),
            })),
            "tool_result" => {
                // Content may be a plain string or an array of blocks.
                let content = match obj.get("content") {
                    Some(Value::String(s)) => vec![ContentBlock::text(s.clone())],
                    Some(v @ Value::Array(_)) => {
                        serde_json::from_value(v.clone()).map_err(serde::de::Error::custom)?
                    }
                    _ => Vec::new(),
                };
                Ok(ContentBlock::ToolResult(ToolResultContent {
                    call_id: obj
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: obj
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    content,
                    is_error: obj.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false),
                }))
            }
            "image" => Ok(ContentBlock::Image(ImageContent {
                data: obj
                    .get("data")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                mime_type: obj
                    .get("mime_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })),
            other => Err(serde::de::Error::custom(format!(
                "unknown content block type: {other}"
            ))),
        }
    }
}

// ---------- Message ----------

/// A single conversation message. Immutable once appended to a session;
/// the visibility flags are the only fields the compactor ever rewrites.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub usage: Option<Usage>,
    pub stop_reason: Option<StopReason>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Whether the message participates in the LLM context.
    pub agent_visible: bool,
    /// Whether the message is rendered to the user.
    pub user_visible: bool,
    pub kind: Option<String>,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
            usage: None,
            stop_reason: None,
            timestamp: now_millis(),
            agent_visible: true,
            user_visible: true,
            kind: None,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            usage: None,
            stop_reason: Some(StopReason::Stop),
            timestamp: now_millis(),
            agent_visible: true,
            user_visible: true,
            kind: None,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: Vec<ContentBlock>,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::ToolResult,
            content: vec![ContentBlock::ToolResult(ToolResultContent {
                call_id: call_id.into(),
                name: name.into(),
                content,
                is_error,
            })],
            usage: None,
            stop_reason: None,
            timestamp: now_millis(),
            agent_visible: true,
            user_visible: true,
            kind: None,
        }
    }

    /// A runtime-generated message that is fed to the LLM as user input.
    pub fn synthetic(text: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            role: Role::Synthetic,
            content: vec![ContentBlock::text(text)],
            usage: None,
            stop_reason: None,
            timestamp: now_millis(),
            agent_visible: true,
            user_visible: false,
            kind: Some(kind.into()),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.as_text().map(|t| t.text.as_str()))
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content.iter().filter_map(|b| b.as_tool_call()).collect()
    }

    pub fn first_tool_result(&self) -> Option<&ToolResultContent> {
        self.content.iter().find_map(|b| b.as_tool_result())
    }

    pub fn is_error_result(&self) -> bool {
        self.first_tool_result().is_some_and(|tr| tr.is_error)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("role", &self.role)?;
        map.serialize_entry("content", &self.content)?;
        if let Some(usage) = &self.usage {
            map.serialize_entry("usage", usage)?;
        }
        if let Some(stop) = &self.stop_reason {
            map.serialize_entry("stop_reason", stop)?;
        }
        map.serialize_entry("timestamp", &self.timestamp)?;
        if !self.agent_visible {
            map.serialize_entry("agent_visible", &false)?;
        }
        if !self.user_visible {
            map.serialize_entry("user_visible", &false)?;
        }
        if let Some(kind) = &self.kind {
            map.serialize_entry("kind", kind)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("message must be an object"))?;

        let role: Role = serde_json::from_value(
            obj.get("role")
                .cloned()
                .ok_or_else(|| serde::de::Error::custom("message missing 'role'"))?,
        )
        .map_err(serde::de::Error::custom)?;

        let content: Vec<ContentBlock> =
            serde_json::from_value(obj.get("content").cloned().unwrap_or(Value::Array(vec![])))
                .map_err(serde::de::Error::custom)?;

        let usage = obj
            .get("usage")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let stop_reason = obj
            .get("stop_reason")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        Ok(Message {
            role,
            content,
            usage,
            stop_reason,
            timestamp: obj.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
            agent_visible: obj
                .get("agent_visible")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            user_visible: obj
                .get("user_visible")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            kind: obj.get("kind").and_then(|v| v.as_str()).map(String::from),
        })
    }
}

// ---------- Tool definition ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ---------- Model ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub context_window: u64,
    pub max_tokens: u64,
    #[serde(default)]
    pub reasoning: bool,
}

// ---------- ThinkingLevel ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub const ALL: [ThinkingLevel; 6] = [
        ThinkingLevel::Off,
        ThinkingLevel::Minimal,
        ThinkingLevel::Low,
        ThinkingLevel::Medium,
        ThinkingLevel::High,
        ThinkingLevel::Xhigh,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }

    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|l| *l == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Xhigh => "xhigh",
        };
        write!(f, "{s}")
    }
}

// ---------- LLM request context ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolSpec>>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub thinking: Option<ThinkingLevel>,
    pub max_tokens: Option<u64>,
    pub session_id: Option<String>,
}

// ---------- AssistantEvent (LLM adapter stream) ----------

/// Events produced by an LLM adapter while streaming one assistant message.
/// The stream is terminated by exactly one `Done` or `Error`.
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    Start {
        partial: Message,
    },
    TextDelta {
        index: usize,
        delta: String,
        partial: Message,
    },
    ThinkingDelta {
        index: usize,
        delta: String,
        partial: Message,
    },
    ToolCallDelta {
        index: usize,
        delta: String,
        partial: Message,
    },
    ToolCallEnd {
        index: usize,
        tool_call: ToolCall,
        partial: Message,
    },
    Done {
        message: Message,
    },
    /// The adapter failed; `message` holds whatever partial content was
    /// streamed, finalized with `stop_reason = error`.
    Error {
        message: Message,
        error: String,
    },
}

impl AssistantEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AssistantEvent::Start { .. } => "start",
            AssistantEvent::TextDelta { .. } => "text_delta",
            AssistantEvent::ThinkingDelta { .. } => "thinking_delta",
            AssistantEvent::ToolCallDelta { .. } => "tool_call_delta",
            AssistantEvent::ToolCallEnd { .. } => "tool_call_end",
            AssistantEvent::Done { .. } => "done",
            AssistantEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssistantEvent::Done { .. } | AssistantEvent::Error { .. })
    }

    pub fn partial(&self) -> &Message {
        match self {
            AssistantEvent::Start { partial }
            | AssistantEvent::TextDelta { partial, .. }
            | AssistantEvent::ThinkingDelta { partial, .. }
            | AssistantEvent::ToolCallDelta { partial, .. }
            | AssistantEvent::ToolCallEnd { partial, .. } => partial,
            AssistantEvent::Done { message } | AssistantEvent::Error { message, .. } => message,
        }
    }
}
