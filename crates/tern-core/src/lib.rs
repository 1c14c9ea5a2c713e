pub mod agent_loop;
pub mod error;
pub mod events;
pub mod executor;
pub mod retry;
pub mod stream;
pub mod types;

pub use agent_loop::{
    AgentStream, LoopConfig, LoopOutcome, MessageQueueFn, QueueMode, run_agent_loop,
};
pub use error::{CoreError, ErrorKind};
pub use events::{AgentEvent, EventSink};
pub use executor::{
    ClampedOutput, ExecutorConfig, OutputLimits, ToolAdapter, ToolExecutor, ToolOutcome,
};
pub use retry::{RetryPolicy, classify_llm_error};
pub use stream::{AssistantStream, EventStream, StreamFn, assistant_stream};
pub use types::{
    AssistantEvent, ContentBlock, ImageContent, LlmContext, Message, Model, Role, StopReason,
    StreamOptions, TextContent, ThinkingContent, ThinkingLevel, ToolCall, ToolResultContent,
    ToolSpec, Usage, now_millis,
};
