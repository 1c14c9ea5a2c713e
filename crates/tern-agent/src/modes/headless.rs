use serde_json::json;

use crate::error::AgentError;
use crate::runtime::session::AgentRuntime;

/// Run one prompt to completion and print a single final JSON document.
pub async fn run_headless_mode(runtime: AgentRuntime, prompt: &str) -> Result<(), AgentError> {
    if prompt.trim().is_empty() {
        return Err(AgentError::validation("headless mode requires a prompt"));
    }

    let done = runtime.prompt(prompt).await?;
    let result = done
        .await
        .map_err(|_| AgentError::internal("turn task dropped its completion channel"))?;

    let output = json!({
        "session_id": runtime.session_id().await,
        "success": result.is_ok(),
        "error": result.as_ref().err().map(|e| e.to_string()),
        "last_assistant_text": runtime.get_last_assistant_text().await,
        "messages": runtime.get_messages().await,
        "stats": runtime.get_session_stats().await,
    });
    println!("{output}");

    result
}
