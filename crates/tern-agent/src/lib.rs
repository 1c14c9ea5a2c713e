pub mod cli;
pub mod compaction;
pub mod config;
pub mod error;
pub mod llm;
pub mod model;
pub mod modes;
pub mod rpc;
pub mod runtime;
pub mod session;
pub mod settings;
pub mod trace;

// ---------- Public API re-exports ----------

pub use error::{AgentError, ErrorKind};

pub use session::store::{CompactionOutcome, SessionStore};
pub use session::tree::SessionTree;
pub use session::types::{SessionEntry, SessionHeader, SessionSummary};

pub use compaction::compactor::{
    CompactionSettings, Compactor, ToolSummaryStrategy, estimate_message_tokens,
    estimate_messages_tokens, estimate_text_tokens,
};

pub use runtime::session::{AgentRuntime, BusyMode, ExporterFn, RuntimeOptions};

pub use rpc::commands::{KNOWN_COMMANDS, RpcRequest, RpcResponse};
pub use rpc::server::{Handler, LineWriter, Reply, RpcServer};

pub use trace::buffer::{TraceBuffer, TraceConfig};
pub use trace::writer::{Phase, TraceEvent, TraceWriter};

pub use model::registry::ModelRegistry;
pub use settings::Settings;
