//! The LLM wire client is an external collaborator: embedders wire one
//! in through `RuntimeOptions::stream_fn`. The binary falls back to an
//! adapter that fails every request with a clear message, which keeps
//! session inspection and management commands usable without a
//! provider linked.

use std::sync::Arc;

use tern_core::stream::{StreamFn, assistant_stream};
use tern_core::types::{AssistantEvent, ContentBlock, Message, StopReason};

pub fn missing_adapter_stream_fn() -> StreamFn {
    Arc::new(|model, _context, _options| {
        let stream = assistant_stream();
        let mut message = Message::assistant(vec![ContentBlock::text("")]);
        message.stop_reason = Some(StopReason::Error);
        stream.emit(AssistantEvent::Error {
            message,
            error: format!(
                "no LLM adapter is linked for model '{}'; embed the runtime and supply a stream function",
                model.id
            ),
        });
        stream.finish(None);
        stream
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tern_core::types::{LlmContext, Model, StreamOptions};

    #[tokio::test]
    async fn every_request_fails_with_a_clear_error() {
        let stream_fn = missing_adapter_stream_fn();
        let model = Model {
            id: "m".to_string(),
            name: "M".to_string(),
            context_window: 1000,
            max_tokens: 100,
            reasoning: false,
        };
        let context = LlmContext {
            system_prompt: None,
            messages: vec![Message::user("hi")],
            tools: None,
        };
        let mut stream = Box::pin(stream_fn(&model, &context, &StreamOptions::default()));
        let event = stream.next().await.unwrap();
        match event {
            AssistantEvent::Error { error, .. } => assert!(error.contains("no LLM adapter")),
            other => panic!("expected error event, got {}", other.event_type()),
        }
    }
}
