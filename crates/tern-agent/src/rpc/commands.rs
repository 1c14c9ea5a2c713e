use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

/// Closed set of command names the server knows about. Anything else is
/// an unknown command; a known name with no registered handler is a
/// distinct failure.
pub const KNOWN_COMMANDS: &[&str] = &[
    "prompt",
    "steer",
    "follow_up",
    "abort",
    "abort_retry",
    "abort_bash",
    "new_session",
    "list_sessions",
    "switch_session",
    "delete_session",
    "clear_session",
    "set_session_name",
    "get_state",
    "get_messages",
    "get_session_stats",
    "get_last_assistant_text",
    "get_fork_messages",
    "get_tree",
    "fork",
    "resume_on_branch",
    "compact",
    "set_auto_compaction",
    "set_tool_call_cutoff",
    "set_tool_summary_strategy",
    "get_available_models",
    "set_model",
    "cycle_model",
    "set_thinking_level",
    "cycle_thinking_level",
    "get_commands",
    "set_steering_mode",
    "set_follow_up_mode",
    "set_auto_retry",
    "export_html",
    "bash",
    "ping",
];

/// One incoming command line.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcRequest {
    /// Free-text payload: `message` preferred, `data.message` fallback.
    pub fn message_text(&self) -> Option<String> {
        if let Some(message) = &self.message {
            return Some(message.clone());
        }
        self.data
            .as_ref()
            .and_then(|d| d.get("message"))
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    pub fn data_str(&self, key: &str) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_bool())
    }

    pub fn data_u64(&self, key: &str) -> Option<u64> {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_u64())
    }
}

/// One outgoing response line.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub response_type: &'static str,
    pub command: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: Option<String>, command: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id,
            response_type: "response",
            command: command.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn fail(id: Option<String>, command: impl Into<String>, error: &AgentError) -> Self {
        Self {
            id,
            response_type: "response",
            command: command.into(),
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    pub fn fail_text(
        id: Option<String>,
        command: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id,
            response_type: "response",
            command: command.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_fallback_to_data() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"id":"1","type":"prompt","data":{"message":"hi"}}"#).unwrap();
        assert_eq!(req.message_text().as_deref(), Some("hi"));

        let req: RpcRequest =
            serde_json::from_str(r#"{"id":"1","type":"prompt","message":"top","data":{"message":"nested"}}"#)
                .unwrap();
        assert_eq!(req.message_text().as_deref(), Some("top"));
    }

    #[test]
    fn response_shape() {
        let ok = RpcResponse::ok(Some("7".to_string()), "ping", None);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["command"], "ping");
        assert_eq!(json["success"], true);

        let err = RpcResponse::fail(
            None,
            "compact",
            &AgentError::nothing_to_compact(),
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().starts_with("nothing_to_compact"));
    }
}
