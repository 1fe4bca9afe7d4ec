use anyhow::{Context, Result};
use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParams, CallToolResult};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::TokioChildProcess;
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::ToolServerConfig;

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub description: String,
    pub input_schema: Value,
}

pub fn qualified_tool_name(server_id: &str, raw_name: &str) -> String {
    format!("{server_id}_{raw_name}")
}

struct StartedServer {
    id: String,
    service: RunningService<RoleClient, ()>,
}

/// Owns every tool server subprocess for its entire lifetime: spawn,
/// handshake, request/response, and teardown in reverse start order.
#[derive(Default)]
pub struct Transport {
    servers: Mutex<Vec<StartedServer>>,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and handshake one tool server. The caller decides whether a
    /// failure here is fatal; a partially spawned child is reaped when the
    /// failed transport handle drops.
    pub async fn start(&self, cfg: &ToolServerConfig) -> Result<()> {
        cfg.validate()?;

        let command_path = cfg.resolve_command()?;
        if !command_path.exists() {
            anyhow::bail!(
                "tool server command '{}' for server '{}' not found",
                command_path.display(),
                cfg.id
            );
        }

        let argv = cfg.to_argv();
        tracing::info!(
            server = %cfg.id,
            command = %command_path.display(),
            args = %argv.join(" "),
            "starting tool server"
        );

        let mut command = Command::new(&command_path);
        command.args(&argv);
        let child = TokioChildProcess::new(command).with_context(|| {
            format!(
                "failed to spawn tool server '{}' from '{}'",
                cfg.id,
                command_path.display()
            )
        })?;

        let service = ()
            .serve(child)
            .await
            .with_context(|| format!("handshake with tool server '{}' failed", cfg.id))?;

        if let Some(info) = service.peer_info() {
            tracing::info!(
                server = %cfg.id,
                peer = %info.server_info.name,
                version = %info.server_info.version,
                "tool server handshake complete"
            );
        }

        self.servers.lock().await.push(StartedServer {
            id: cfg.id.clone(),
            service,
        });
        Ok(())
    }

    pub async fn server_ids(&self) -> Vec<String> {
        self.servers
            .lock()
            .await
            .iter()
            .map(|server| server.id.clone())
            .collect()
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>> {
        let peer = self.peer(server_id).await?;
        let listed = peer
            .list_tools(Default::default())
            .await
            .with_context(|| format!("listing tools on server '{server_id}' failed"))?;

        Ok(listed
            .tools
            .into_iter()
            .map(|tool| ToolDescriptor {
                qualified_name: qualified_tool_name(server_id, &tool.name),
                description: tool
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .to_string(),
                input_schema: Value::Object((*tool.input_schema).clone()),
            })
            .collect())
    }

    /// One request/response invocation. Failures come back as error values
    /// for the caller to fold into the conversation; nothing panics across
    /// this boundary.
    pub async fn call_tool(
        &self,
        server_id: &str,
        raw_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String> {
        let peer = self.peer(server_id).await?;
        let result = peer
            .call_tool(CallToolRequestParams::new(raw_name.to_string()).with_arguments(arguments))
            .await
            .with_context(|| format!("tool '{raw_name}' on server '{server_id}' failed"))?;

        Ok(call_result_text(&result))
    }

    /// Tear down every started subprocess exactly once, in reverse start
    /// order. Safe to call repeatedly; later calls find nothing left.
    pub async fn close_all(&self) {
        let mut servers = self.servers.lock().await;
        while let Some(server) = servers.pop() {
            tracing::info!(server = %server.id, "stopping tool server");
            if let Err(err) = server.service.cancel().await {
                tracing::warn!(
                    server = %server.id,
                    error = %err,
                    "tool server shutdown reported an error"
                );
            }
        }
    }

    async fn peer(&self, server_id: &str) -> Result<rmcp::service::Peer<RoleClient>> {
        self.servers
            .lock()
            .await
            .iter()
            .find(|server| server.id == server_id)
            .map(|server| server.service.peer().clone())
            .with_context(|| format!("tool server '{server_id}' is not connected"))
    }
}

fn call_result_text(result: &CallToolResult) -> String {
    let text = result
        .content
        .iter()
        .filter_map(|content| content.as_text().map(|t| t.text.as_str()))
        .collect::<Vec<&str>>()
        .join("\n");

    if text.is_empty() {
        "(tool returned no textual content)".to_string()
    } else {
        text
    }
}
