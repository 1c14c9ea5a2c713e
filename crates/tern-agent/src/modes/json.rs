use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::error::AgentError;
use crate::runtime::session::AgentRuntime;

/// Newline-delimited event stream: run the given prompts in order,
/// printing every lifecycle event as one JSON line.
pub async fn run_json_mode(runtime: AgentRuntime, prompts: &[String]) -> Result<(), AgentError> {
    if prompts.is_empty() {
        return Err(AgentError::validation("json mode requires a prompt"));
    }

    let stdout = Arc::new(Mutex::new(std::io::stdout()));
    let sink = stdout.clone();
    runtime.subscribe(Box::new(move |event| {
        let mut out = sink.lock().unwrap();
        let _ = writeln!(out, "{}", event.to_wire());
        let _ = out.flush();
    }));

    for prompt in prompts {
        let done = runtime.prompt(prompt).await?;
        done.await
            .map_err(|_| AgentError::internal("turn task dropped its completion channel"))??;
    }
    Ok(())
}
