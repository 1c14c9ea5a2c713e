use std::collections::HashMap;

use crate::error::AgentError;
use crate::session::types::SessionEntry;

/// In-memory view of a session's entry forest. Entries are kept in
/// append order; `by_id` indexes into that vector; `leaf` is the entry
/// new appends will hang off.
#[derive(Debug, Default)]
pub struct SessionTree {
    entries: Vec<SessionEntry>,
    by_id: HashMap<String, usize>,
    leaf: Option<String>,
}

impl SessionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from journal order. The last line of the journal was the
    /// leaf at the time it was written, so it becomes the leaf again.
    pub fn from_entries(entries: Vec<SessionEntry>) -> Self {
        let mut tree = Self::new();
        for entry in entries {
            let id = entry.id().to_string();
            if tree.by_id.contains_key(&id) {
                tracing::warn!("duplicate entry id {id} ignored");
                continue;
            }
            tree.by_id.insert(id.clone(), tree.entries.len());
            tree.entries.push(entry);
            tree.leaf = Some(id);
        }
        tree
    }

    /// Append a new entry; its parent must already exist (or be None for
    /// a root). Advances the leaf pointer.
    pub fn append(&mut self, entry: SessionEntry) -> Result<(), AgentError> {
        let id = entry.id().to_string();
        if self.by_id.contains_key(&id) {
            return Err(AgentError::validation(format!("duplicate entry id: {id}")));
        }
        if let Some(parent) = entry.parent_id() {
            if !self.by_id.contains_key(parent) {
                return Err(AgentError::validation(format!(
                    "parent entry not found: {parent}"
                )));
            }
        }
        self.by_id.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        self.leaf = Some(id);
        Ok(())
    }

    pub fn leaf(&self) -> Option<&str> {
        self.leaf.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.by_id.get(id).map(|&idx| &self.entries[idx])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionEntry> {
        self.by_id.get(id).map(|&idx| &mut self.entries[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move the leaf pointer without touching entries.
    pub fn branch_to(&mut self, id: &str) -> Result<(), AgentError> {
        if !self.by_id.contains_key(id) {
            return Err(AgentError::not_found(format!("entry not found: {id}")));
        }
        self.leaf = Some(id.to_string());
        Ok(())
    }

    /// Root→target path. Defaults to the current leaf. A parent missing
    /// from the tree (lazy-loaded tail) terminates the walk there.
    pub fn branch(&self, target: Option<&str>) -> Result<Vec<&SessionEntry>, AgentError> {
        let Some(target) = target.map(str::to_string).or_else(|| self.leaf.clone()) else {
            return Ok(Vec::new());
        };
        if !self.by_id.contains_key(target.as_str()) {
            return Err(AgentError::not_found(format!("entry not found: {target}")));
        }

        let mut path = Vec::new();
        let mut current = Some(target);
        while let Some(id) = current {
            let Some(entry) = self.get(&id) else { break };
            path.push(entry);
            current = entry.parent_id().map(str::to_string);
        }
        path.reverse();
        Ok(path)
    }

    /// Child ids per entry, in append order. Used by tree introspection.
    pub fn children(&self) -> HashMap<&str, Vec<&str>> {
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for entry in &self.entries {
            if let Some(parent) = entry.parent_id() {
                children.entry(parent).or_default().push(entry.id());
            }
        }
        children
    }

    pub fn roots(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.parent_id().is_none_or(|p| !self.by_id.contains_key(p)))
            .map(|e| e.id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::types::Message;

    fn message_entry(id: &str, parent: Option<&str>, text: &str) -> SessionEntry {
        SessionEntry::Message {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            timestamp: 0,
            message: Message::user(text),
        }
    }

    fn three_entry_tree() -> SessionTree {
        SessionTree::from_entries(vec![
            message_entry("e1", None, "one"),
            message_entry("e2", Some("e1"), "two"),
            message_entry("e3", Some("e2"), "three"),
        ])
    }

    #[test]
    fn leaf_is_last_journal_line() {
        let tree = three_entry_tree();
        assert_eq!(tree.leaf(), Some("e3"));
    }

    #[test]
    fn branch_walks_root_to_leaf() {
        let tree = three_entry_tree();
        let ids: Vec<_> = tree.branch(None).unwrap().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn branch_to_moves_leaf_and_new_appends_branch() {
        let mut tree = three_entry_tree();
        tree.branch_to("e1").unwrap();
        tree.append(message_entry("e4", Some("e1"), "fork")).unwrap();
        let ids: Vec<_> = tree.branch(None).unwrap().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["e1", "e4"]);

        // The old branch is still reachable.
        let ids: Vec<_> = tree.branch(Some("e3")).unwrap().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn duplicate_and_dangling_appends_are_rejected() {
        let mut tree = three_entry_tree();
        assert!(tree.append(message_entry("e1", None, "dup")).is_err());
        assert!(tree.append(message_entry("e9", Some("missing"), "x")).is_err());
    }

    #[test]
    fn children_map_tracks_branches() {
        let mut tree = three_entry_tree();
        tree.branch_to("e1").unwrap();
        tree.append(message_entry("e4", Some("e1"), "fork")).unwrap();
        let children = tree.children();
        assert_eq!(children["e1"], vec!["e2", "e4"]);
    }

    #[test]
    fn branch_tolerates_missing_parent_after_lazy_load() {
        // Simulates a tail-only load where e1 was not read.
        let tree = SessionTree::from_entries(vec![
            message_entry("e2", Some("e1"), "two"),
            message_entry("e3", Some("e2"), "three"),
        ]);
        let ids: Vec<_> = tree.branch(None).unwrap().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["e2", "e3"]);
        assert_eq!(tree.roots(), vec!["e2"]);
    }
}
