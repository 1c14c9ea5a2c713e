use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

pub const APP_NAME: &str = "tern";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONFIG_DIR_NAME: &str = ".tern";
pub const SESSIONS_DIR_NAME: &str = "sessions";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const TRACE_DIR_NAME: &str = "traces";

/// Default base directory: ~/.tern/
pub static DEFAULT_BASE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
});

pub fn resolve_base_dir(override_dir: Option<&Path>) -> PathBuf {
    override_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| DEFAULT_BASE_DIR.clone())
}

/// Sessions root for a working directory: `<base>/sessions/<sanitized cwd>/`.
pub fn sessions_root(base: &Path, cwd: &Path) -> PathBuf {
    base.join(SESSIONS_DIR_NAME).join(sanitize_path(cwd))
}

pub fn settings_file(base: &Path) -> PathBuf {
    base.join(SETTINGS_FILE_NAME)
}

pub fn trace_dir(base: &Path) -> PathBuf {
    base.join(TRACE_DIR_NAME)
}

/// Flatten a path into a single directory-name-safe component.
pub fn sanitize_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    sanitized.trim_matches('-').to_string()
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Environment read once at startup.
#[derive(Debug, Clone)]
pub struct Env {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Whether per-token delta events reach the output stream. On
    /// unless explicitly disabled.
    pub stream_verbose: bool,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            stream_verbose: true,
        }
    }
}

impl Env {
    pub fn from_process() -> Self {
        Self {
            api_key: std::env::var("TERN_API_KEY").ok().filter(|v| !v.is_empty()),
            base_url: std::env::var("TERN_BASE_URL").ok().filter(|v| !v.is_empty()),
            model: std::env::var("TERN_MODEL").ok().filter(|v| !v.is_empty()),
            stream_verbose: std::env::var("TERN_STREAM_VERBOSE")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_flattens_separators() {
        assert_eq!(sanitize_path(Path::new("/home/dev/proj")), "home-dev-proj");
        assert_eq!(sanitize_path(Path::new("a b/c")), "a-b-c");
    }

    #[test]
    fn sessions_root_is_keyed_by_cwd() {
        let root = sessions_root(Path::new("/base"), Path::new("/work/x"));
        assert_eq!(root, PathBuf::from("/base/sessions/work-x"));
    }
}
