//! Summarization prompt text and transcript serialization.

use tern_core::types::{ContentBlock, Message, Role};

pub const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are a context summarization assistant. You produce structured summaries of coding conversations that preserve every technical detail an AI coding assistant needs to keep working: goals, file paths, code changes, command results, decisions, and open problems.";

pub const SUMMARIZATION_PROMPT: &str = r#"Analyze the conversation below and produce a structured summary with these sections:

## Goal
What the user is trying to accomplish.

## Progress
Files created/modified/deleted, commands run and their outcomes, key code changes, test results.

## Key Decisions
Architecture choices, library selections, trade-offs, constraints.

## Current State
What works, what is broken or incomplete, next steps, blockers.

## Important Context
Environment details, configuration, error messages still in play, important file paths.

Be concise but thorough. Prefer technical accuracy over brevity; keep concrete file paths, function names, and error text."#;

pub const UPDATE_SUMMARIZATION_PROMPT: &str = r#"Update the existing structured summary with the new conversation segment. Keep the same sections:

1. Extend Progress with new actions.
2. Add new Key Decisions.
3. Rewrite Current State to the latest state.
4. Extend Important Context with new details.
5. Keep Goal unless the user's goal changed.

Merge rather than replace: the result must retain every important fact from both the previous summary and the new segment."#;

/// Text of the synthetic user message a compaction injects at the head
/// of the projected context.
pub const COMPACTION_SUMMARY_PREFIX: &str = "The conversation history before this point was compacted into the following summary:\n\n<summary>\n";
pub const COMPACTION_SUMMARY_SUFFIX: &str = "\n</summary>";

/// First line of the synthetic digest message produced by tool-result
/// archiving.
pub const ARCHIVED_TOOL_CONTEXT_PREFIX: &str = "[ARCHIVED_TOOL_CONTEXT:";

pub fn compaction_summary_text(summary: &str) -> String {
    format!("{COMPACTION_SUMMARY_PREFIX}{summary}{COMPACTION_SUMMARY_SUFFIX}")
}

pub fn summary_request(conversation: &str, previous_summary: Option<&str>) -> String {
    match previous_summary {
        None => format!("{SUMMARIZATION_PROMPT}\n\n<conversation>\n{conversation}\n</conversation>"),
        Some(prev) => format!(
            "{UPDATE_SUMMARIZATION_PROMPT}\n\n<previous-summary>\n{prev}\n</previous-summary>\n\n<conversation>\n{conversation}\n</conversation>"
        ),
    }
}

fn format_tool_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{k}={value}")
            })
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Role-prefixed transcript fed to the summarization request.
pub fn serialize_transcript(messages: &[Message]) -> String {
    let mut parts = Vec::new();

    for msg in messages {
        match msg.role {
            Role::User | Role::Synthetic => {
                let text = msg.text();
                if !text.is_empty() {
                    parts.push(format!("[User]: {text}"));
                }
            }
            Role::Assistant => {
                let mut texts = Vec::new();
                let mut calls = Vec::new();
                for block in &msg.content {
                    match block {
                        ContentBlock::Thinking(t) => {
                            parts.push(format!("[Assistant thinking]: {}", t.thinking));
                        }
                        ContentBlock::Text(t) => texts.push(t.text.clone()),
                        ContentBlock::ToolCall(tc) => {
                            calls.push(format!("{}({})", tc.name, format_tool_args(&tc.arguments)));
                        }
                        _ => {}
                    }
                }
                if !texts.is_empty() {
                    parts.push(format!("[Assistant]: {}", texts.join("\n")));
                }
                if !calls.is_empty() {
                    parts.push(format!("[Assistant tool calls]: {}", calls.join("; ")));
                }
            }
            Role::ToolResult => {
                let text = msg
                    .first_tool_result()
                    .map(|tr| {
                        tr.content
                            .iter()
                            .filter_map(|b| b.as_text().map(|t| t.text.clone()))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                parts.push(format!("[Tool result]: {}", clip(&text, 500)));
            }
        }
    }

    parts.join("\n\n")
}

/// One digest line per archived tool result: name, status, and the
/// first 200 chars with newlines flattened.
pub fn tool_result_digest(msg: &Message) -> String {
    let Some(tr) = msg.first_tool_result() else {
        return String::new();
    };
    let status = if tr.is_error { "error" } else { "ok" };
    let text: String = tr
        .content
        .iter()
        .filter_map(|b| b.as_text().map(|t| t.text.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\n', " ");
    format!("{} ({status}): {}", tr.name, clip(&text, 200))
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tern_core::types::{ToolCall, ToolResultContent};

    #[test]
    fn transcript_covers_roles() {
        let messages = vec![
            Message::user("fix the bug"),
            Message::assistant(vec![
                ContentBlock::Thinking(tern_core::types::ThinkingContent {
                    thinking: "hmm".to_string(),
                }),
                ContentBlock::text("on it"),
                ContentBlock::ToolCall(ToolCall {
                    call_id: "c1".to_string(),
                    name: "read".to_string(),
                    arguments: json!({"path": "main.rs"}),
                }),
            ]),
            Message::tool_result("c1", "read", vec![ContentBlock::text("fn main() {}")], false),
        ];

        let transcript = serialize_transcript(&messages);
        assert!(transcript.contains("[User]: fix the bug"));
        assert!(transcript.contains("[Assistant thinking]: hmm"));
        assert!(transcript.contains("[Assistant]: on it"));
        assert!(transcript.contains("[Assistant tool calls]: read(path=main.rs)"));
        assert!(transcript.contains("[Tool result]: fn main() {}"));
    }

    #[test]
    fn long_tool_results_are_clipped() {
        let messages = vec![Message::tool_result(
            "c1",
            "read",
            vec![ContentBlock::text("x".repeat(900))],
            false,
        )];
        let transcript = serialize_transcript(&messages);
        assert!(transcript.contains("..."));
        assert!(transcript.len() < 900);
    }

    #[test]
    fn digest_flattens_newlines_and_clips() {
        let msg = Message {
            content: vec![ContentBlock::ToolResult(ToolResultContent {
                call_id: "c1".to_string(),
                name: "bash".to_string(),
                content: vec![ContentBlock::text(format!("line1\nline2\n{}", "y".repeat(400)))],
                is_error: true,
            })],
            ..Message::tool_result("c1", "bash", vec![], true)
        };
        let digest = tool_result_digest(&msg);
        assert!(digest.starts_with("bash (error): line1 line2"));
        assert!(!digest.contains('\n'));
        assert!(digest.chars().count() < 260);
    }

    #[test]
    fn prompt_selection_depends_on_previous_summary() {
        let fresh = summary_request("convo", None);
        assert!(fresh.contains("## Goal"));
        let update = summary_request("convo", Some("earlier"));
        assert!(update.contains("Update the existing structured summary"));
        assert!(update.contains("<previous-summary>\nearlier"));
    }
}
