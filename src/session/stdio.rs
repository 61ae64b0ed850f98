//! rmcp-backed connector: the MCP server runs as a child process and speaks
//! the protocol over its stdin/stdout.

use anyhow::Context;
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, JsonObject, ListToolsResult},
    service::{Peer, RoleClient, RunningService, ServiceError},
    transport::TokioChildProcess,
    ServiceExt,
};
use serde_json::json;
use tokio::process::Command;

use super::{ExitStack, ProtocolSession, ServerParams, SessionConnector, SessionError};

/// Launches the configured command and serves an rmcp client over its stdio
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioConnector;

impl StdioConnector {
    pub fn new() -> Self {
        Self
    }

    fn command(params: &ServerParams) -> Command {
        let mut command = Command::new(&params.command);
        // The child inherits our environment; configured values win.
        command.args(&params.args).envs(&params.env);
        command
    }
}

#[async_trait]
impl SessionConnector for StdioConnector {
    async fn connect(
        &self,
        params: &ServerParams,
        cleanup: &mut ExitStack,
    ) -> anyhow::Result<Box<dyn ProtocolSession>> {
        // The transport owns the child (killed on drop). `serve` consumes it and
        // drops it again if the handshake fails, so nothing is left running.
        let transport = TokioChildProcess::new(Self::command(params))
            .with_context(|| format!("failed to launch `{}`", params.command))?;

        let running: RunningService<RoleClient, ()> = ()
            .serve(transport)
            .await
            .context("MCP initialize handshake failed")?;

        if let Some(info) = running.peer_info() {
            tracing::debug!(
                server = %info.server_info.name,
                version = %info.server_info.version,
                "MCP server identified"
            );
        }

        let peer = running.peer().clone();
        cleanup.push("mcp client service", move || async move {
            let reason = running.cancel().await?;
            tracing::debug!(?reason, "MCP client service stopped");
            Ok(())
        });

        Ok(Box::new(RmcpSession { peer }))
    }
}

/// Requests on an initialized rmcp client peer
struct RmcpSession {
    peer: Peer<RoleClient>,
}

#[async_trait]
impl ProtocolSession for RmcpSession {
    async fn list_tools(&self) -> Result<ListToolsResult, SessionError> {
        self.peer
            .list_tools(None)
            .await
            .map_err(|e| classify(e, "tools/list"))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<CallToolResult, SessionError> {
        let request = call_tool_request(name, arguments)
            .map_err(|e| SessionError::Rejected(format!("{:#}", e)))?;
        self.peer
            .call_tool(request)
            .await
            .map_err(|e| classify(e, &format!("tools/call `{}`", name)))
    }
}

/// Error replies leave the session usable; anything else means the
/// transport can no longer be trusted.
fn classify(error: ServiceError, request: &str) -> SessionError {
    match error {
        ServiceError::McpError(reply) => {
            SessionError::Rejected(format!("{} failed: {}", request, reply))
        }
        other => {
            SessionError::Broken(anyhow::Error::new(other).context(format!("{} failed", request)))
        }
    }
}

/// Build the tools/call parameters; optional protocol fields keep their defaults
fn call_tool_request(name: &str, arguments: JsonObject) -> anyhow::Result<CallToolRequestParam> {
    serde_json::from_value(json!({
        "name": name,
        "arguments": arguments,
    }))
    .context("invalid tools/call parameters")
}
