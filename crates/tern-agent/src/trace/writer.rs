use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::AgentError;

/// Perfetto event phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    End,
    Complete,
    Instant,
    Counter,
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            Phase::Begin => "B",
            Phase::End => "E",
            Phase::Complete => "X",
            Phase::Instant => "I",
            Phase::Counter => "C",
        })
    }
}

/// One perfetto trace event.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub cat: String,
    pub ph: Phase,
    /// Microseconds.
    pub ts: i64,
    pub pid: u32,
    pub tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Deterministic lane id from a span key (e.g. a tool call id), so a
/// span's begin/end land on the same track.
pub fn tid_for_key(key: &str) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    // Keep it readable in trace viewers.
    (hasher.finish() % 10_000) as u32 + 1
}

impl TraceEvent {
    pub fn instant(name: impl Into<String>, cat: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            name: name.into(),
            cat: cat.into(),
            ph: Phase::Instant,
            ts: now_micros(),
            pid: std::process::id(),
            tid: 0,
            dur: None,
            args,
        }
    }

    pub fn begin(name: impl Into<String>, cat: impl Into<String>, span_key: &str) -> Self {
        Self {
            name: name.into(),
            cat: cat.into(),
            ph: Phase::Begin,
            ts: now_micros(),
            pid: std::process::id(),
            tid: tid_for_key(span_key),
            dur: None,
            args: None,
        }
    }

    pub fn end(
        name: impl Into<String>,
        cat: impl Into<String>,
        span_key: &str,
        duration_us: u64,
        args: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            cat: cat.into(),
            ph: Phase::End,
            ts: now_micros(),
            pid: std::process::id(),
            tid: tid_for_key(span_key),
            dur: Some(duration_us),
            args,
        }
    }
}

const FILE_PREFIX: &str = "{\"displayTimeUnit\":\"ms\",\"traceEvents\":[";
const FILE_SUFFIX: &str = "]}";

/// Appends events into a perfetto-format JSON file, rotating to a fresh
/// file once the size cap is reached. The array stays open between
/// flushes and is closed on rotation or finalize.
pub struct TraceWriter {
    dir: PathBuf,
    max_file_bytes: u64,
    file: Option<File>,
    path: Option<PathBuf>,
    bytes_written: u64,
    events_in_file: u64,
    file_index: u32,
}

impl TraceWriter {
    pub fn new(dir: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_file_bytes,
            file: None,
            path: None,
            bytes_written: 0,
            events_in_file: 0,
            file_index: 0,
        }
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn write_events(&mut self, events: &[TraceEvent]) -> Result<(), AgentError> {
        if events.is_empty() {
            return Ok(());
        }
        if self.file.is_none() {
            self.open_next_file()?;
        }

        let file = self.file.as_mut().expect("opened above");
        for event in events {
            let json = serde_json::to_string(event)?;
            if self.events_in_file > 0 {
                file.write_all(b",")?;
                self.bytes_written += 1;
            }
            file.write_all(json.as_bytes())?;
            self.bytes_written += json.len() as u64;
            self.events_in_file += 1;
        }
        file.flush()?;

        if self.bytes_written >= self.max_file_bytes {
            self.finalize()?;
        }
        Ok(())
    }

    /// Close the open array and file; the next write starts a new file.
    pub fn finalize(&mut self) -> Result<(), AgentError> {
        if let Some(mut file) = self.file.take() {
            file.write_all(FILE_SUFFIX.as_bytes())?;
            file.sync_data()?;
        }
        self.path = None;
        self.bytes_written = 0;
        self.events_in_file = 0;
        Ok(())
    }

    fn open_next_file(&mut self) -> Result<(), AgentError> {
        crate::config::ensure_dir(&self.dir)?;
        let path = self.dir.join(format!(
            "trace-{}-{:03}.json",
            std::process::id(),
            self.file_index
        ));
        self.file_index += 1;
        let mut file = File::create(&path)?;
        file.write_all(FILE_PREFIX.as_bytes())?;
        self.bytes_written = FILE_PREFIX.len() as u64;
        self.events_in_file = 0;
        self.file = Some(file);
        self.path = Some(path);
        Ok(())
    }
}
