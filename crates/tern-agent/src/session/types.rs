use serde::{Deserialize, Serialize};
use tern_core::types::{Message, Role, now_millis};

pub const SESSION_FILE_VERSION: u32 = 1;
pub const SESSION_FILE_NAME: &str = "messages.jsonl";
pub const SESSION_LOCK_NAME: &str = "messages.jsonl.lock";

fn session_header_tag() -> String {
    "session".to_string()
}

/// First line of a session journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    #[serde(rename = "type", default = "session_header_tag")]
    pub entry_type: String,
    #[serde(default)]
    pub version: u32,
    pub id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default = "now_millis")]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_compaction_id: Option<String>,
    /// Byte offset into the entry region (everything after the header
    /// line) from which a lazy load can safely start parsing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_offset: Option<u64>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            entry_type: "session".to_string(),
            version: SESSION_FILE_VERSION,
            id: id.into(),
            cwd: cwd.into(),
            timestamp: now_millis(),
            parent_session: None,
            last_compaction_id: None,
            resume_offset: None,
        }
    }
}

/// One line of the journal after the header. Entries form a forest via
/// `parent_id`; an append always points at the entry that was the leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEntry {
    #[serde(rename = "message")]
    Message {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        timestamp: i64,
        message: Message,
    },

    #[serde(rename = "compaction")]
    Compaction {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        timestamp: i64,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        first_kept_entry_id: Option<String>,
        #[serde(default)]
        tokens_before: u64,
    },

    #[serde(rename = "branch_summary")]
    BranchSummary {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        timestamp: i64,
        summary: String,
    },

    #[serde(rename = "session_info")]
    SessionInfo {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
}

impl SessionEntry {
    pub fn id(&self) -> &str {
        match self {
            SessionEntry::Message { id, .. }
            | SessionEntry::Compaction { id, .. }
            | SessionEntry::BranchSummary { id, .. }
            | SessionEntry::SessionInfo { id, .. } => id,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            SessionEntry::Message { parent_id, .. }
            | SessionEntry::Compaction { parent_id, .. }
            | SessionEntry::BranchSummary { parent_id, .. }
            | SessionEntry::SessionInfo { parent_id, .. } => parent_id.as_deref(),
        }
    }

    pub fn set_parent_id(&mut self, parent: Option<String>) {
        match self {
            SessionEntry::Message { parent_id, .. }
            | SessionEntry::Compaction { parent_id, .. }
            | SessionEntry::BranchSummary { parent_id, .. }
            | SessionEntry::SessionInfo { parent_id, .. } => *parent_id = parent,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SessionEntry::Message { timestamp, .. }
            | SessionEntry::Compaction { timestamp, .. }
            | SessionEntry::BranchSummary { timestamp, .. }
            | SessionEntry::SessionInfo { timestamp, .. } => *timestamp,
        }
    }

    pub fn entry_type(&self) -> &'static str {
        match self {
            SessionEntry::Message { .. } => "message",
            SessionEntry::Compaction { .. } => "compaction",
            SessionEntry::BranchSummary { .. } => "branch_summary",
            SessionEntry::SessionInfo { .. } => "session_info",
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            SessionEntry::Message { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn as_message_mut(&mut self) -> Option<&mut Message> {
        match self {
            SessionEntry::Message { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether a compaction boundary may be placed at this entry.
    pub fn is_cuttable(&self) -> bool {
        match self {
            SessionEntry::Message { message, .. } => message.role == Role::User,
            SessionEntry::Compaction { .. } | SessionEntry::BranchSummary { .. } => true,
            SessionEntry::SessionInfo { .. } => false,
        }
    }

    pub fn message(message: Message) -> Self {
        SessionEntry::Message {
            id: Self::new_id(),
            parent_id: None,
            timestamp: now_millis(),
            message,
        }
    }

    /// Short unique entry id: 8 hex chars.
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }
}

/// Lightweight per-session metadata for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub entry_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::types::Message;

    #[test]
    fn entry_round_trip() {
        let entry = SessionEntry::Compaction {
            id: "abcd1234".to_string(),
            parent_id: Some("00112233".to_string()),
            timestamp: 1000,
            summary: "it went well".to_string(),
            first_kept_entry_id: Some("44556677".to_string()),
            tokens_before: 9000,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"compaction\""));
        let loaded: SessionEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.id(), "abcd1234");
        assert_eq!(loaded.entry_type(), "compaction");
    }

    #[test]
    fn cuttable_entries() {
        let user = SessionEntry::message(Message::user("hi"));
        assert!(user.is_cuttable());

        let assistant = SessionEntry::message(Message::assistant(vec![]));
        assert!(!assistant.is_cuttable());

        let summary = SessionEntry::BranchSummary {
            id: SessionEntry::new_id(),
            parent_id: None,
            timestamp: 0,
            summary: "s".to_string(),
        };
        assert!(summary.is_cuttable());
    }

    #[test]
    fn new_ids_are_short_and_distinct() {
        let a = SessionEntry::new_id();
        let b = SessionEntry::new_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn header_round_trip_keeps_resume_offset() {
        let mut header = SessionHeader::new("s1", "/work");
        header.resume_offset = Some(420);
        header.last_compaction_id = Some("deadbeef".to_string());
        let json = serde_json::to_string(&header).unwrap();
        let loaded: SessionHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.resume_offset, Some(420));
        assert_eq!(loaded.last_compaction_id.as_deref(), Some("deadbeef"));
    }
}
