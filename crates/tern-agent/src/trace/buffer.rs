use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::error::AgentError;
use crate::trace::writer::{TraceEvent, TraceWriter};

#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Ring capacity; events past this are dropped and counted.
    pub capacity: usize,
    /// Flush once this many events are buffered.
    pub flush_count: usize,
    /// Flush at least this often while events are pending.
    pub flush_interval: Duration,
    /// Rotate the output file past this size.
    pub max_file_bytes: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            flush_count: 256,
            flush_interval: Duration::from_secs(5),
            max_file_bytes: 16 * 1024 * 1024,
        }
    }
}

struct BufferState {
    ring: VecDeque<TraceEvent>,
    dropped: u64,
    last_flush: Instant,
}

/// Hook invoked with the dropped-event count whenever an overflow is
/// observed at flush time (the RPC server uses it to emit a
/// `trace_overflow` wire event).
pub type OverflowHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Bounded in-memory trace ring with threshold/interval/explicit flush.
pub struct TraceBuffer {
    config: TraceConfig,
    state: Mutex<BufferState>,
    writer: Mutex<TraceWriter>,
    overflow_hook: Mutex<Option<OverflowHook>>,
}

impl TraceBuffer {
    pub fn new(dir: impl Into<std::path::PathBuf>, config: TraceConfig) -> Self {
        let writer = TraceWriter::new(dir, config.max_file_bytes);
        Self {
            config,
            state: Mutex::new(BufferState {
                ring: VecDeque::new(),
                dropped: 0,
                last_flush: Instant::now(),
            }),
            writer: Mutex::new(writer),
            overflow_hook: Mutex::new(None),
        }
    }

    pub fn set_overflow_hook(&self, hook: OverflowHook) {
        *self.overflow_hook.lock().unwrap() = Some(hook);
    }

    /// Record one event; flushes when the count threshold is reached.
    pub fn record(&self, event: TraceEvent) {
        let should_flush = {
            let mut state = self.state.lock().unwrap();
            if state.ring.len() >= self.config.capacity {
                state.ring.pop_front();
                state.dropped += 1;
            }
            state.ring.push_back(event);
            state.ring.len() >= self.config.flush_count
        };
        if should_flush {
            if let Err(e) = self.flush() {
                tracing::warn!("trace flush failed: {e}");
            }
        }
    }

    /// Interval-based flush, driven by a periodic tick.
    pub fn maybe_flush_interval(&self) {
        let due = {
            let state = self.state.lock().unwrap();
            !state.ring.is_empty() && state.last_flush.elapsed() >= self.config.flush_interval
        };
        if due {
            if let Err(e) = self.flush() {
                tracing::warn!("trace flush failed: {e}");
            }
        }
    }

    /// Drain the ring into the trace file. An observed overflow inserts
    /// a `trace_overflow` marker carrying the dropped count.
    pub fn flush(&self) -> Result<(), AgentError> {
        let (mut events, dropped) = {
            let mut state = self.state.lock().unwrap();
            let events: Vec<TraceEvent> = state.ring.drain(..).collect();
            let dropped = std::mem::take(&mut state.dropped);
            state.last_flush = Instant::now();
            (events, dropped)
        };

        if dropped > 0 {
            events.insert(
                0,
                TraceEvent::instant(
                    "trace_overflow",
                    "trace",
                    Some(serde_json::json!({ "dropped": dropped })),
                ),
            );
            if let Some(hook) = self.overflow_hook.lock().unwrap().clone() {
                hook(dropped);
            }
        }

        if events.is_empty() {
            return Ok(());
        }
        self.writer.lock().unwrap().write_events(&events)
    }

    /// One-shot mode: record a batch and, when `last` is set, flush and
    /// close the current file.
    pub fn handle(&self, events: Vec<TraceEvent>, last: bool) -> Result<(), AgentError> {
        self.handle_chunk(events, last)
    }

    /// Streaming mode: append a chunk; `last` finalizes the file.
    pub fn handle_chunk(&self, events: Vec<TraceEvent>, last: bool) -> Result<(), AgentError> {
        for event in events {
            self.record(event);
        }
        if last {
            self.flush()?;
            self.writer.lock().unwrap().finalize()?;
        }
        Ok(())
    }

    /// Explicit flush-and-close, used on session close.
    pub fn close(&self) -> Result<(), AgentError> {
        self.flush()?;
        self.writer.lock().unwrap().finalize()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().ring.len()
    }
}

// ---------- Process-wide active buffer ----------

// The tracing sink must be reachable from helpers that cannot take it
// as an argument; this is the one sanctioned global slot, set on
// session start and cleared on end.
static ACTIVE_BUFFER: Lazy<RwLock<Option<Arc<TraceBuffer>>>> = Lazy::new(|| RwLock::new(None));

pub fn set_active(buffer: Arc<TraceBuffer>) {
    *ACTIVE_BUFFER.write().unwrap() = Some(buffer);
}

pub fn clear_active() {
    *ACTIVE_BUFFER.write().unwrap() = None;
}

pub fn active() -> Option<Arc<TraceBuffer>> {
    ACTIVE_BUFFER.read().unwrap().clone()
}

/// Record into the active buffer, if any.
pub fn record(event: TraceEvent) {
    if let Some(buffer) = active() {
        buffer.record(event);
    }
}

/// Spawn the interval-flush tick for a buffer; stops on cancellation.
pub fn spawn_flush_task(
    buffer: Arc<TraceBuffer>,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = buffer.config.flush_interval;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = buffer.close();
                    break;
                }
                _ = tick.tick() => buffer.maybe_flush_interval(),
            }
        }
    })
}
