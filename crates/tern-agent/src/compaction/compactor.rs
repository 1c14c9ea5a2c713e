use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tern_core::stream::StreamFn;
use tern_core::types::{
    AssistantEvent, ContentBlock, LlmContext, Message, Model, Role, StopReason, StreamOptions,
};

use crate::compaction::prompts;
use crate::error::AgentError;
use crate::session::store::{CompactionOutcome, SessionStore};
use crate::session::types::SessionEntry;

/// Bytes-per-token divisor of the estimation heuristic.
const BYTES_PER_TOKEN: u64 = 4;
/// Flat byte-equivalent charged per image block.
const IMAGE_BYTES: u64 = 4800;
/// Flat token overhead assumed for tool definitions.
const TOOL_OVERHEAD_TOKENS: u64 = 3000;
/// Floor for the computed compaction threshold.
const MIN_THRESHOLD_TOKENS: u64 = 4000;
/// Keep-recent budget when nothing else pins one down.
const DEFAULT_KEEP_RECENT_TOKENS: u64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSummaryStrategy {
    Llm,
    Heuristic,
    Off,
}

impl ToolSummaryStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm" => Some(Self::Llm),
            "heuristic" => Some(Self::Heuristic),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

/// The compactor's tunables. Travels as one immutable record; runtime
/// mutations replace the record atomically and consumers snapshot it at
/// turn start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompactionSettings {
    pub max_messages: usize,
    pub max_tokens: u64,
    pub keep_recent_messages: usize,
    pub keep_recent_tokens: u64,
    pub reserve_tokens: u64,
    pub tool_call_cutoff: usize,
    pub tool_summary_strategy: ToolSummaryStrategy,
    pub auto_compact: bool,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            max_messages: 0,
            max_tokens: 100_000,
            keep_recent_messages: 0,
            keep_recent_tokens: 0,
            reserve_tokens: 16_384,
            tool_call_cutoff: 10,
            tool_summary_strategy: ToolSummaryStrategy::Heuristic,
            auto_compact: true,
        }
    }
}

// ---------- Token estimation ----------

pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(BYTES_PER_TOKEN)
}

/// Byte-length heuristic over a message's blocks; invisible messages
/// cost nothing since they never reach the model.
pub fn estimate_message_tokens(message: &Message) -> u64 {
    if !message.agent_visible {
        return 0;
    }
    let mut bytes: u64 = 0;
    for block in &message.content {
        bytes += block_bytes(block);
    }
    bytes.div_ceil(BYTES_PER_TOKEN)
}

fn block_bytes(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text(t) => t.text.len() as u64,
        ContentBlock::Thinking(t) => t.thinking.len() as u64,
        ContentBlock::ToolCall(tc) => (tc.name.len() + tc.arguments.to_string().len()) as u64,
        ContentBlock::ToolResult(tr) => tr.content.iter().map(block_bytes).sum(),
        ContentBlock::Image(_) => IMAGE_BYTES,
    }
}

pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Token-budget driven compaction engine.
pub struct Compactor {
    settings: CompactionSettings,
    context_window: u64,
    system_prompt_tokens: u64,
}

impl Compactor {
    pub fn new(settings: CompactionSettings, context_window: u64, system_prompt: &str) -> Self {
        Self {
            settings,
            context_window,
            system_prompt_tokens: estimate_text_tokens(system_prompt),
        }
    }

    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    /// Estimated context tokens for a request assembled from `messages`.
    /// Authoritative usage from the most recent non-error assistant
    /// message is preferred; only trailing messages after it are
    /// estimated heuristically.
    pub fn estimate_context_tokens(&self, messages: &[Message]) -> u64 {
        let authoritative = messages.iter().rposition(|m| {
            m.role == Role::Assistant
                && !matches!(m.stop_reason, Some(StopReason::Error) | Some(StopReason::Aborted))
                && m.usage.as_ref().is_some_and(|u| u.context_total() > 0)
        });

        match authoritative {
            Some(idx) => {
                let usage = messages[idx].usage.as_ref().expect("checked above");
                let trailing = estimate_messages_tokens(&messages[idx + 1..]);
                usage.context_total() + trailing + self.system_prompt_tokens
            }
            None => estimate_messages_tokens(messages) + self.system_prompt_tokens,
        }
    }

    /// Compaction trigger threshold in tokens.
    pub fn threshold(&self) -> u64 {
        if self.context_window > 0 {
            let overhead =
                self.system_prompt_tokens + TOOL_OVERHEAD_TOKENS + self.settings.reserve_tokens;
            let available = self.context_window.saturating_sub(overhead);
            MIN_THRESHOLD_TOKENS.max(available * 3 / 4)
        } else {
            self.settings.max_tokens
        }
    }

    /// Monotone in both message count and token estimate.
    pub fn should_compact(&self, messages: &[Message]) -> bool {
        if !self.settings.auto_compact {
            return false;
        }
        if self.settings.max_messages > 0 && messages.len() >= self.settings.max_messages {
            return true;
        }
        self.estimate_context_tokens(messages) >= self.threshold()
    }

    /// Token budget for the suffix kept after a compaction.
    pub fn keep_recent_budget(&self) -> u64 {
        let threshold = self.threshold();
        if self.settings.keep_recent_tokens > 0 {
            self.settings.keep_recent_tokens.min(threshold * 3 / 10)
        } else if threshold > 0 {
            threshold / 4
        } else {
            DEFAULT_KEEP_RECENT_TOKENS
        }
    }

    /// Pick the boundary entry on a branch: the oldest suffix position
    /// whose messages fit the keep-recent budget, moved forward to the
    /// next cuttable entry when necessary. Entries at or before the most
    /// recent compaction are never revisited. Returns the boundary
    /// entry's id, or None when there is nothing to compact.
    pub fn select_boundary<'a>(&self, branch: &[&'a SessionEntry]) -> Option<&'a SessionEntry> {
        let start = branch
            .iter()
            .rposition(|e| matches!(e, SessionEntry::Compaction { .. }))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let window = &branch[start..];
        if window.is_empty() {
            return None;
        }

        // A configured keep-recent message count decides the cut
        // directly; otherwise the token budget does.
        let raw_cut = if self.settings.keep_recent_messages > 0 {
            let message_positions: Vec<usize> = window
                .iter()
                .enumerate()
                .filter(|(_, e)| e.as_message().is_some())
                .map(|(i, _)| i)
                .collect();
            if message_positions.len() <= self.settings.keep_recent_messages {
                0
            } else {
                message_positions[message_positions.len() - self.settings.keep_recent_messages]
            }
        } else {
            let budget = self.keep_recent_budget();
            let mut accumulated: u64 = 0;
            let mut cut = 0usize;
            for i in (0..window.len()).rev() {
                if let Some(message) = window[i].as_message() {
                    accumulated += estimate_message_tokens(message);
                }
                if accumulated >= budget {
                    cut = i;
                    break;
                }
            }
            cut
        };

        if raw_cut == 0 {
            return None;
        }

        // The boundary must land on a cuttable entry; search forward.
        window[raw_cut..].iter().find(|e| e.is_cuttable()).copied()
    }

    /// Whether a cuttable boundary exists on the branch since the last
    /// compaction.
    pub fn can_compact(&self, branch: &[&SessionEntry]) -> bool {
        self.select_boundary(branch).is_some()
    }

    /// Issue the single summarization request and concatenate streamed
    /// text deltas. LLM errors surface unchanged; empty output is an
    /// error.
    pub async fn summarize(
        &self,
        stream_fn: &StreamFn,
        model: &Model,
        options: &StreamOptions,
        to_summarize: &[Message],
        previous_summary: Option<&str>,
    ) -> Result<String, AgentError> {
        let transcript = prompts::serialize_transcript(to_summarize);
        let request = prompts::summary_request(&transcript, previous_summary);

        let context = LlmContext {
            system_prompt: Some(prompts::SUMMARIZATION_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(request)],
            tools: None,
        };

        let mut stream = Box::pin(stream_fn(model, &context, options));
        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event {
                AssistantEvent::TextDelta { delta, .. } => summary.push_str(&delta),
                AssistantEvent::Done { message } => {
                    if summary.is_empty() {
                        summary = message.text();
                    }
                    break;
                }
                AssistantEvent::Error { error, .. } => {
                    return Err(AgentError::new(
                        tern_core::retry::classify_llm_error(&error),
                        error,
                    ));
                }
                _ => {}
            }
        }

        if summary.trim().is_empty() {
            return Err(AgentError::internal("summarization produced an empty summary"));
        }
        Ok(summary)
    }

    /// Run a full compaction against the store: select the boundary,
    /// summarize everything before it, archive excess tool results in
    /// the kept window, and append the compaction entry.
    pub async fn compact_session(
        &self,
        store: &mut SessionStore,
        stream_fn: &StreamFn,
        model: &Model,
        options: &StreamOptions,
    ) -> Result<CompactionOutcome, AgentError> {
        let branch = store.get_branch(None)?;
        if matches!(branch.last(), Some(SessionEntry::Compaction { .. })) {
            return Err(AgentError::already_compacted());
        }

        let branch_refs: Vec<&SessionEntry> = branch.iter().collect();
        let messages_before = store.get_messages();
        let tokens_before = self.estimate_context_tokens(&messages_before);

        let Some(boundary) = self.select_boundary(&branch_refs) else {
            return Err(AgentError::nothing_to_compact());
        };
        let boundary_id = boundary.id().to_string();
        let boundary_idx = branch_refs
            .iter()
            .position(|e| e.id() == boundary_id)
            .expect("boundary comes from this branch");

        // Previous summary on the branch selects the "update" prompt.
        let previous_summary = branch_refs.iter().rev().find_map(|e| match e {
            SessionEntry::Compaction { summary, .. }
            | SessionEntry::BranchSummary { summary, .. } => Some(summary.clone()),
            _ => None,
        });

        // Only the window since the last compaction is summarized; the
        // earlier history already lives in the previous summary.
        let window_start = branch_refs
            .iter()
            .rposition(|e| matches!(e, SessionEntry::Compaction { .. }))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let to_summarize: Vec<Message> = branch_refs[window_start..boundary_idx]
            .iter()
            .filter_map(|e| e.as_message())
            .filter(|m| m.agent_visible)
            .cloned()
            .collect();
        if to_summarize.is_empty() {
            return Err(AgentError::nothing_to_compact());
        }

        let summary = self
            .summarize(
                stream_fn,
                model,
                options,
                &to_summarize,
                previous_summary.as_deref(),
            )
            .await?;

        // Archive surplus tool results inside the kept window.
        let archived = if self.settings.tool_summary_strategy == ToolSummaryStrategy::Off {
            0
        } else {
            self.archive_tool_results(
                store,
                &branch_refs[boundary_idx..],
                stream_fn,
                model,
                options,
            )
            .await?
        };

        store.append_compaction(summary.clone(), Some(boundary_id.clone()), tokens_before)?;

        let tokens_after = self.estimate_context_tokens(&store.get_messages());
        Ok(CompactionOutcome {
            summary,
            first_kept_entry_id: Some(boundary_id),
            tokens_before,
            tokens_after,
            archived_tool_results: archived,
        })
    }

    /// If the kept window holds more visible tool results than
    /// `tool_call_cutoff`, flag the oldest surplus invisible and append
    /// one agent-visible digest message covering them. Strategy `llm`
    /// asks the model to write the digest body, falling back to the
    /// heuristic one-liners when that request fails.
    async fn archive_tool_results(
        &self,
        store: &mut SessionStore,
        kept: &[&SessionEntry],
        stream_fn: &StreamFn,
        model: &Model,
        options: &StreamOptions,
    ) -> Result<usize, AgentError> {
        let visible: Vec<(String, Message)> = kept
            .iter()
            .filter_map(|e| {
                e.as_message()
                    .filter(|m| m.role == Role::ToolResult && m.agent_visible)
                    .map(|m| (e.id().to_string(), m.clone()))
            })
            .collect();

        if visible.len() <= self.settings.tool_call_cutoff {
            return Ok(0);
        }

        let excess = visible.len() - self.settings.tool_call_cutoff;
        let archived = &visible[..excess];

        let digest_lines: Vec<String> = archived
            .iter()
            .map(|(_, message)| prompts::tool_result_digest(message))
            .collect();

        let body = if self.settings.tool_summary_strategy == ToolSummaryStrategy::Llm {
            let archived_messages: Vec<Message> =
                archived.iter().map(|(_, m)| m.clone()).collect();
            match self
                .summarize(stream_fn, model, options, &archived_messages, None)
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!("llm tool digest failed, using heuristic: {e}");
                    digest_lines.join("\n")
                }
            }
        } else {
            digest_lines.join("\n")
        };

        let ids: Vec<String> = archived.iter().map(|(id, _)| id.clone()).collect();
        store.mark_archived(&ids, "tool_result_archived");

        let digest_text = format!("{}\n{body}\n]", prompts::ARCHIVED_TOOL_CONTEXT_PREFIX);
        let mut digest = Message::assistant(vec![ContentBlock::text(digest_text)]);
        digest.stop_reason = None;
        digest.user_visible = false;
        digest.kind = Some("tool_summary".to_string());
        store.append_message(digest)?;

        Ok(archived.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tern_core::stream::assistant_stream;
    use tern_core::types::Usage;

    fn compactor(settings: CompactionSettings, context_window: u64) -> Compactor {
        Compactor::new(settings, context_window, "system prompt text")
    }

    fn entry(id: &str, message: Message) -> SessionEntry {
        SessionEntry::Message {
            id: id.to_string(),
            parent_id: None,
            timestamp: 0,
            message,
        }
    }

    #[test]
    fn text_estimation_divides_by_four() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn image_blocks_cost_a_flat_rate() {
        let msg = Message::user("");
        let mut with_image = msg.clone();
        with_image.content = vec![ContentBlock::Image(tern_core::types::ImageContent {
            data: "ignored".to_string(),
            mime_type: "image/png".to_string(),
        })];
        assert_eq!(estimate_message_tokens(&with_image), IMAGE_BYTES / 4);
    }

    #[test]
    fn invisible_messages_cost_nothing() {
        let mut msg = Message::user("plenty of text in this message");
        msg.agent_visible = false;
        assert_eq!(estimate_message_tokens(&msg), 0);
    }

    #[test]
    fn authoritative_usage_takes_over_estimation() {
        let c = compactor(CompactionSettings::default(), 0);
        let mut assistant = Message::assistant(vec![ContentBlock::text("answer")]);
        assistant.usage = Some(Usage {
            input: 900,
            output: 100,
            cache_read: 0,
            cache_write: 0,
            total: 1000,
        });
        let trailing = Message::user("follow-up");
        let messages = vec![Message::user("question"), assistant, trailing.clone()];

        let expected = 1000 + estimate_message_tokens(&trailing) + c.system_prompt_tokens;
        assert_eq!(c.estimate_context_tokens(&messages), expected);
    }

    #[test]
    fn estimation_without_usage_sums_visible_messages() {
        let c = compactor(CompactionSettings::default(), 0);
        let messages = vec![Message::user("aaaa"), Message::user("bbbb")];
        assert_eq!(
            c.estimate_context_tokens(&messages),
            estimate_messages_tokens(&messages) + c.system_prompt_tokens
        );
    }

    #[test]
    fn threshold_from_context_window() {
        let settings = CompactionSettings {
            reserve_tokens: 1000,
            ..Default::default()
        };
        let c = compactor(settings, 100_000);
        // overhead = sys(5) + 3000 + 1000; available ≈ 95995; threshold = 3/4.
        let overhead = c.system_prompt_tokens + 3000 + 1000;
        assert_eq!(c.threshold(), (100_000 - overhead) * 3 / 4);

        // Tiny window floors at the minimum.
        let c = compactor(CompactionSettings::default(), 5000);
        assert_eq!(c.threshold(), MIN_THRESHOLD_TOKENS);

        // No window: fall back to max_tokens.
        let c = compactor(
            CompactionSettings {
                max_tokens: 42_000,
                ..Default::default()
            },
            0,
        );
        assert_eq!(c.threshold(), 42_000);
    }

    #[test]
    fn should_compact_is_monotone() {
        let settings = CompactionSettings {
            max_messages: 3,
            auto_compact: true,
            ..Default::default()
        };
        let c = compactor(settings, 1_000_000);

        let few: Vec<Message> = (0..2).map(|i| Message::user(format!("m{i}"))).collect();
        let many: Vec<Message> = (0..5).map(|i| Message::user(format!("m{i}"))).collect();
        assert!(!c.should_compact(&few));
        assert!(c.should_compact(&many));

        // Token-driven trigger, monotone in size.
        let c = compactor(CompactionSettings::default(), 6000);
        let small = vec![Message::user("short")];
        let big = vec![Message::user("x".repeat(40_000))];
        assert!(!c.should_compact(&small));
        assert!(c.should_compact(&big));
    }

    #[test]
    fn auto_compact_off_never_triggers() {
        let c = compactor(
            CompactionSettings {
                auto_compact: false,
                max_messages: 1,
                ..Default::default()
            },
            100,
        );
        let messages = vec![Message::user("x".repeat(10_000))];
        assert!(!c.should_compact(&messages));
    }

    #[test]
    fn keep_recent_budget_clamps() {
        let c = compactor(
            CompactionSettings {
                keep_recent_tokens: 1_000_000,
                ..Default::default()
            },
            100_000,
        );
        assert_eq!(c.keep_recent_budget(), c.threshold() * 3 / 10);

        let c = compactor(CompactionSettings::default(), 100_000);
        assert_eq!(c.keep_recent_budget(), c.threshold() / 4);
    }

    #[test]
    fn boundary_moves_forward_to_cuttable_entry() {
        // assistant×10, user, assistant×3 — the raw cut lands in the
        // assistant tail and must advance to the user entry.
        let mut entries = Vec::new();
        for i in 0..10 {
            entries.push(entry(
                &format!("a{i}"),
                Message::assistant(vec![ContentBlock::text("x".repeat(400))]),
            ));
        }
        entries.push(entry("u1", Message::user("the user speaks")));
        for i in 0..3 {
            entries.push(entry(
                &format!("b{i}"),
                Message::assistant(vec![ContentBlock::text("y".repeat(400))]),
            ));
        }
        let refs: Vec<&SessionEntry> = entries.iter().collect();

        let c = compactor(
            CompactionSettings {
                keep_recent_tokens: 500,
                ..Default::default()
            },
            1_000_000,
        );
        let boundary = c.select_boundary(&refs).expect("boundary");
        assert_eq!(boundary.id(), "u1");
    }

    #[test]
    fn no_cuttable_entry_means_nothing_to_compact() {
        let entries: Vec<SessionEntry> = (0..10)
            .map(|i| {
                entry(
                    &format!("a{i}"),
                    Message::assistant(vec![ContentBlock::text("z".repeat(400))]),
                )
            })
            .collect();
        let refs: Vec<&SessionEntry> = entries.iter().collect();
        let c = compactor(
            CompactionSettings {
                keep_recent_tokens: 100,
                ..Default::default()
            },
            1_000_000,
        );
        assert!(c.select_boundary(&refs).is_none());
        assert!(!c.can_compact(&refs));
    }

    #[test]
    fn everything_fits_means_no_boundary() {
        let entries = vec![entry("u1", Message::user("tiny"))];
        let refs: Vec<&SessionEntry> = entries.iter().collect();
        let c = compactor(CompactionSettings::default(), 1_000_000);
        assert!(c.select_boundary(&refs).is_none());
    }

    fn scripted_summary_fn(text: &'static str) -> StreamFn {
        Arc::new(move |_model, _context, _options| {
            let stream = assistant_stream();
            let message = Message::assistant(vec![ContentBlock::text(text)]);
            stream.emit(AssistantEvent::TextDelta {
                index: 0,
                delta: text.to_string(),
                partial: message.clone(),
            });
            stream.emit(AssistantEvent::Done {
                message: message.clone(),
            });
            stream.finish(Some(message));
            stream
        })
    }

    fn test_model() -> Model {
        Model {
            id: "m".to_string(),
            name: "M".to_string(),
            context_window: 1_000_000,
            max_tokens: 4096,
            reasoning: false,
        }
    }

    #[tokio::test]
    async fn summarize_concatenates_deltas() {
        let c = compactor(CompactionSettings::default(), 0);
        let summary = c
            .summarize(
                &scripted_summary_fn("the summary"),
                &test_model(),
                &StreamOptions::default(),
                &[Message::user("hello")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary, "the summary");
    }

    #[tokio::test]
    async fn empty_summary_is_an_error() {
        let c = compactor(CompactionSettings::default(), 0);
        let err = c
            .summarize(
                &scripted_summary_fn("   "),
                &test_model(),
                &StreamOptions::default(),
                &[Message::user("hello")],
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn compact_session_by_count_keeps_recent_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("sessions");
        let mut store = SessionStore::create(&root, "s1", "").unwrap();
        store.append_message(Message::user("one is old")).unwrap();
        let e2 = store.append_message(Message::user("two is kept")).unwrap();
        store.append_message(Message::user("three is kept")).unwrap();

        let c = compactor(
            CompactionSettings {
                max_messages: 3,
                keep_recent_messages: 2,
                auto_compact: true,
                ..Default::default()
            },
            0,
        );
        assert!(c.should_compact(&store.get_messages()));

        let outcome = c
            .compact_session(
                &mut store,
                &scripted_summary_fn("compact summary"),
                &test_model(),
                &StreamOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.first_kept_entry_id.as_deref(), Some(e2.as_str()));
        assert!(outcome.tokens_before > 0);

        let messages = store.get_messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].text().contains("compact summary"));
        assert_eq!(messages[1].text(), "two is kept");
        assert_eq!(messages[2].text(), "three is kept");
    }

    #[tokio::test]
    async fn recompacting_a_compacted_tip_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("sessions");
        let mut store = SessionStore::create(&root, "s1", "").unwrap();
        store.append_message(Message::user("one")).unwrap();
        store
            .append_compaction("done already".to_string(), None, 10)
            .unwrap();

        let c = compactor(CompactionSettings::default(), 0);
        let err = c
            .compact_session(
                &mut store,
                &scripted_summary_fn("unused"),
                &test_model(),
                &StreamOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AlreadyCompacted);
    }

    #[tokio::test]
    async fn tool_results_over_cutoff_are_archived_with_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("sessions");
        let mut store = SessionStore::create(&root, "s1", "").unwrap();
        store.append_message(Message::user("old old old")).unwrap();
        let kept = store.append_message(Message::user("kept")).unwrap();
        store
            .append_message(Message::tool_result(
                "c1",
                "bash",
                vec![ContentBlock::text("first output")],
                false,
            ))
            .unwrap();
        store
            .append_message(Message::tool_result(
                "c2",
                "bash",
                vec![ContentBlock::text("second output")],
                false,
            ))
            .unwrap();

        let c = compactor(
            CompactionSettings {
                tool_call_cutoff: 1,
                keep_recent_messages: 3,
                ..Default::default()
            },
            0,
        );
        let outcome = c
            .compact_session(
                &mut store,
                &scripted_summary_fn("s"),
                &test_model(),
                &StreamOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.archived_tool_results, 1);
        let _ = kept;

        // The oldest tool result is flagged invisible with the archive kind.
        let archived = store
            .entries()
            .iter()
            .filter_map(|e| e.as_message())
            .find(|m| m.kind.as_deref() == Some("tool_result_archived"))
            .expect("archived message");
        assert!(!archived.agent_visible);
        assert_eq!(archived.first_tool_result().unwrap().call_id, "c1");

        // A visible digest message covers it.
        let digest = store
            .entries()
            .iter()
            .filter_map(|e| e.as_message())
            .find(|m| m.kind.as_deref() == Some("tool_summary"))
            .expect("digest message");
        assert!(digest.agent_visible);
        assert!(digest.text().starts_with("[ARCHIVED_TOOL_CONTEXT:"));
        assert!(digest.text().contains("first output"));
        assert!(!digest.text().contains("second output"));

        // The survivors keep their visibility.
        let second = store
            .entries()
            .iter()
            .filter_map(|e| e.as_message())
            .find(|m| {
                m.first_tool_result()
                    .is_some_and(|tr| tr.call_id == "c2")
            })
            .unwrap();
        assert!(second.agent_visible);
    }

    #[tokio::test]
    async fn strategy_off_skips_archiving() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("sessions");
        let mut store = SessionStore::create(&root, "s1", "").unwrap();
        store.append_message(Message::user("old old old")).unwrap();
        store.append_message(Message::user("kept")).unwrap();
        for i in 0..3 {
            store
                .append_message(Message::tool_result(
                    format!("c{i}"),
                    "bash",
                    vec![ContentBlock::text("out")],
                    false,
                ))
                .unwrap();
        }

        let c = compactor(
            CompactionSettings {
                tool_call_cutoff: 1,
                keep_recent_messages: 4,
                tool_summary_strategy: ToolSummaryStrategy::Off,
                ..Default::default()
            },
            0,
        );
        let outcome = c
            .compact_session(
                &mut store,
                &scripted_summary_fn("s"),
                &test_model(),
                &StreamOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.archived_tool_results, 0);
        assert!(!store
            .entries()
            .iter()
            .filter_map(|e| e.as_message())
            .any(|m| m.kind.as_deref() == Some("tool_summary")));
    }
}
