use tern_core::types::Message;

use crate::compaction::prompts::compaction_summary_text;
use crate::session::types::SessionEntry;

/// Project a branch into the linear message list used for LLM requests.
///
/// If a compaction lies on the branch, everything before its
/// `first_kept_entry_id` collapses into one synthetic user-facing
/// summary message; otherwise all message entries are emitted.
/// Messages flagged `agent_visible=false` never appear.
pub fn project_context(branch: &[&SessionEntry]) -> Vec<Message> {
    let last_compaction = branch
        .iter()
        .rposition(|e| matches!(e, SessionEntry::Compaction { .. }));

    let Some(compaction_idx) = last_compaction else {
        return branch
            .iter()
            .filter_map(|e| e.as_message())
            .filter(|m| m.agent_visible)
            .cloned()
            .collect();
    };

    let (summary, first_kept) = match branch[compaction_idx] {
        SessionEntry::Compaction {
            summary,
            first_kept_entry_id,
            ..
        } => (summary.clone(), first_kept_entry_id.clone()),
        _ => unreachable!(),
    };

    let mut result = vec![Message::synthetic(
        compaction_summary_text(&summary),
        "compaction_summary",
    )];

    // Kept suffix: from first_kept_entry_id (which precedes the
    // compaction entry) through the end of the branch, skipping the
    // compaction entry itself.
    let start = first_kept
        .as_deref()
        .and_then(|id| branch.iter().position(|e| e.id() == id))
        .unwrap_or(compaction_idx + 1);

    for (idx, entry) in branch.iter().enumerate().skip(start) {
        if idx == compaction_idx {
            continue;
        }
        if let Some(message) = entry.as_message() {
            if message.agent_visible {
                result.push(message.clone());
            }
        }
    }

    result
}
