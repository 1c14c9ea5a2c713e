use tern_core::types::Model;

/// In-process table of known models. The LLM wire client lives outside
/// this crate; the registry only informs context-window math and the
/// model-control RPC commands.
pub struct ModelRegistry {
    models: Vec<Model>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: builtin_models(),
        }
    }

    pub fn with_models(models: Vec<Model>) -> Self {
        Self { models }
    }

    pub fn all(&self) -> &[Model] {
        &self.models
    }

    pub fn default_model(&self) -> &Model {
        &self.models[0]
    }

    /// Exact id match first, then case-insensitive substring.
    pub fn find(&self, pattern: &str) -> Option<&Model> {
        if let Some(exact) = self.models.iter().find(|m| m.id == pattern) {
            return Some(exact);
        }
        let needle = pattern.to_lowercase();
        self.models
            .iter()
            .find(|m| m.id.to_lowercase().contains(&needle) || m.name.to_lowercase().contains(&needle))
    }

    /// The model after `current_id`, wrapping around.
    pub fn next_after(&self, current_id: &str) -> &Model {
        let idx = self
            .models
            .iter()
            .position(|m| m.id == current_id)
            .map(|i| (i + 1) % self.models.len())
            .unwrap_or(0);
        &self.models[idx]
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_models() -> Vec<Model> {
    vec![
        Model {
            id: "sonnet-large".to_string(),
            name: "Sonnet (large context)".to_string(),
            context_window: 200_000,
            max_tokens: 16_384,
            reasoning: true,
        },
        Model {
            id: "sonnet-fast".to_string(),
            name: "Sonnet (fast)".to_string(),
            context_window: 128_000,
            max_tokens: 8_192,
            reasoning: false,
        },
        Model {
            id: "haiku-mini".to_string(),
            name: "Haiku (mini)".to_string(),
            context_window: 64_000,
            max_tokens: 4_096,
            reasoning: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_by_id_and_substring() {
        let registry = ModelRegistry::new();
        assert_eq!(registry.find("sonnet-large").unwrap().id, "sonnet-large");
        assert_eq!(registry.find("haiku").unwrap().id, "haiku-mini");
        assert!(registry.find("gpt-99").is_none());
    }

    #[test]
    fn cycle_wraps() {
        let registry = ModelRegistry::new();
        let first = registry.default_model().id.clone();
        let second = registry.next_after(&first).id.clone();
        assert_ne!(first, second);
        let mut current = first.clone();
        for _ in 0..registry.all().len() {
            current = registry.next_after(&current).id.clone();
        }
        assert_eq!(current, first);
    }
}
