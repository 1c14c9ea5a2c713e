use std::sync::Arc;

use crate::error::AgentError;
use crate::rpc::server::{LineWriter, RpcServer};
use crate::runtime::session::AgentRuntime;

/// JSON command protocol over stdio: stdin carries commands, stdout
/// carries responses and events. Runs until stdin closes.
pub async fn run_rpc_mode(runtime: AgentRuntime) -> Result<(), AgentError> {
    let writer = LineWriter::new(Box::new(std::io::stdout()));
    let server = RpcServer::new(runtime, writer);
    Arc::clone(&server).serve(tokio::io::stdin()).await;
    Ok(())
}
