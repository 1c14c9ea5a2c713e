use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compaction::compactor::CompactionSettings;
use crate::error::AgentError;

/// Tool executor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolSettings {
    pub max_concurrent_tools: usize,
    pub tool_timeout_ms: u64,
    pub queue_timeout_ms: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tools: 4,
            tool_timeout_ms: 120_000,
            queue_timeout_ms: 30_000,
        }
    }
}

/// Tool output truncation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutputSettings {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        let limits = tern_core::executor::OutputLimits::default();
        Self {
            max_lines: limits.max_lines,
            max_bytes: limits.max_bytes,
        }
    }
}

/// Log sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LogSettings {
    pub level: Option<String>,
    pub file: Option<String>,
    pub prefix: Option<String>,
}

/// The recognized option set. Unknown keys anywhere in the file are
/// rejected with a clear error rather than silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub compaction: CompactionSettings,
    pub tools: ToolSettings,
    pub output: OutputSettings,
    pub log: LogSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            AgentError::validation(format!("unrecognized settings in {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), AgentError> {
        if let Some(parent) = path.parent() {
            crate::config::ensure_dir(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn executor_config(&self) -> tern_core::executor::ExecutorConfig {
        tern_core::executor::ExecutorConfig {
            max_concurrent_tools: self.tools.max_concurrent_tools,
            tool_timeout: std::time::Duration::from_millis(self.tools.tool_timeout_ms),
            queue_timeout: std::time::Duration::from_millis(self.tools.queue_timeout_ms),
            output: tern_core::executor::OutputLimits {
                max_lines: self.output.max_lines,
                max_bytes: self.output.max_bytes,
            },
        }
    }
}
