use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};

use crate::backend::{ChatBackend, ChatRequest, ToolCallRequest, ToolSpec};
use crate::config::RuntimeConfig;
use crate::session::Session;
use crate::telemetry::TelemetrySink;
use crate::transport::{ToolDescriptor, Transport};

pub const ANSWER_SYSTEM_PROMPT: &str = "\
You are an expert assistant for analyzing sub-tasks about a specific internet service.

Your workflow for each sub-task:
1. Restate the sub-task in your own words to confirm its scope.
2. Plan the steps needed to answer it.
3. When a step needs facts from the service documentation, call the document \
retrieval tool with a focused query. Only call it when documentation is \
genuinely required.
4. Synthesize what you planned and retrieved into one clear, accurate answer.

Answer with the complete solution for the sub-task, not your intermediate \
thought process. If retrieved content is insufficient or irrelevant, say so \
and explain how you proceed without it.";

const BUDGET_EXHAUSTED_ANSWER: &str =
    "Maximum tool iterations reached; the task may not be fully resolved.";
const NO_CONTENT_ANSWER: &str = "The model provided no textual content.";

/// Seam between the answer loop and the subprocess transport, so loop
/// behavior is testable with a scripted invoker.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        server_id: &str,
        raw_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String>;
}

#[async_trait]
impl ToolInvoker for Transport {
    async fn invoke(
        &self,
        server_id: &str,
        raw_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String> {
        self.call_tool(server_id, raw_name, arguments).await
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub server_id: String,
    pub raw_name: String,
    pub descriptor: ToolDescriptor,
}

pub struct ToolAgent {
    backend: Arc<dyn ChatBackend>,
    invoker: Arc<dyn ToolInvoker>,
    transport: Option<Arc<Transport>>,
    tools: HashMap<String, RegisteredTool>,
    tool_order: Vec<String>,
    model: String,
    temperature: f32,
    max_tool_iterations: usize,
    telemetry: TelemetrySink,
}

impl ToolAgent {
    /// Start every enabled tool server and merge its advertised tools into
    /// the qualified-name map. A server that fails to start is skipped with a
    /// warning; an empty tool set degrades answering to text-only.
    pub async fn initialize(
        backend: Arc<dyn ChatBackend>,
        cfg: &RuntimeConfig,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        let transport = Arc::new(Transport::new());
        let mut agent = Self {
            backend,
            invoker: transport.clone(),
            transport: Some(transport.clone()),
            tools: HashMap::new(),
            tool_order: Vec::new(),
            model: cfg.require_model()?.to_string(),
            temperature: cfg.temperature,
            max_tool_iterations: cfg.max_tool_iterations,
            telemetry,
        };

        for server in cfg.tool_servers.iter().filter(|server| server.enabled) {
            if let Err(err) = transport.start(server).await {
                tracing::warn!(
                    server = %server.id,
                    error = %err,
                    "tool server failed to start; continuing without it"
                );
                continue;
            }

            match transport.list_tools(&server.id).await {
                Ok(descriptors) => {
                    if descriptors.is_empty() {
                        tracing::warn!(server = %server.id, "tool server listed no tools");
                    }
                    for descriptor in descriptors {
                        agent.register(&server.id, descriptor);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        server = %server.id,
                        error = %err,
                        "listing tools failed; server registers nothing"
                    );
                }
            }
        }

        if agent.tools.is_empty() {
            tracing::warn!("no tools registered from any server; answers will be text-only");
        }
        agent
            .telemetry
            .emit("agent.initialized", json!({ "tools": agent.tool_order.len() }));

        Ok(agent)
    }

    /// Build an agent over an arbitrary invoker and pre-registered tools
    /// (`(server_id, descriptor)` pairs). This is the seam the loop tests
    /// use; production goes through `initialize`.
    pub fn with_invoker(
        backend: Arc<dyn ChatBackend>,
        invoker: Arc<dyn ToolInvoker>,
        tools: Vec<(String, ToolDescriptor)>,
        model: String,
        temperature: f32,
        max_tool_iterations: usize,
        telemetry: TelemetrySink,
    ) -> Self {
        let mut agent = Self {
            backend,
            invoker,
            transport: None,
            tools: HashMap::new(),
            tool_order: Vec::new(),
            model,
            temperature,
            max_tool_iterations,
            telemetry,
        };
        for (server_id, descriptor) in tools {
            agent.register(&server_id, descriptor);
        }
        agent
    }

    fn register(&mut self, server_id: &str, descriptor: ToolDescriptor) {
        let qualified = descriptor.qualified_name.clone();
        let raw_name = qualified
            .strip_prefix(&format!("{server_id}_"))
            .unwrap_or(&qualified)
            .to_string();
        tracing::info!(server = %server_id, tool = %qualified, "registered tool");
        if !self.tools.contains_key(&qualified) {
            self.tool_order.push(qualified.clone());
        }
        self.tools.insert(
            qualified,
            RegisteredTool {
                server_id: server_id.to_string(),
                raw_name,
                descriptor,
            },
        );
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tool_order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                ToolSpec::function(
                    tool.descriptor.qualified_name.clone(),
                    tool.descriptor.description.clone(),
                    tool.descriptor.input_schema.clone(),
                )
            })
            .collect()
    }

    /// Answer one clarification question with a bounded tool-calling loop.
    /// Budget exhaustion is a defined termination mode: the last assistant
    /// text (or a fixed notice) comes back instead of an error.
    pub async fn answer(&self, question: &str) -> Result<String> {
        let mut session = Session::new(ANSWER_SYSTEM_PROMPT);
        session.push_user(format!(
            "I am trying to understand and implement a feature related to a specific service.\n\
             My current sub-task is: \"{question}\"\n\n\
             Please follow your workflow to resolve this sub-task."
        ));

        let specs = self.tool_specs();

        for round in 0..self.max_tool_iterations {
            tracing::debug!(round = round + 1, "tool agent round");
            let request = ChatRequest {
                model: self.model.clone(),
                messages: session.turns().to_vec(),
                temperature: self.temperature,
                tools: (!specs.is_empty()).then(|| specs.clone()),
                tool_choice: (!specs.is_empty()).then(|| "auto".to_string()),
            };

            let completion = match self.backend.complete(&request).await {
                Ok(completion) => completion,
                Err(err) => {
                    // The planner folds this text into its conversation and
                    // can decide how to continue; the loop itself never
                    // aborts on a backend failure mid-question.
                    tracing::warn!(error = %err, "tool agent backend call failed");
                    return Ok(format!("Error calling model backend: {err:#}"));
                }
            };

            if completion.tool_calls.is_empty() {
                let answer = completion
                    .content
                    .clone()
                    .filter(|content| !content.trim().is_empty());
                if let Some(content) = &completion.content {
                    session.push_assistant(Some(content.clone()), Vec::new());
                }
                return Ok(answer.unwrap_or_else(|| NO_CONTENT_ANSWER.to_string()));
            }

            let calls = completion.tool_calls.clone();
            session.push_assistant(completion.content.clone(), calls.clone());
            self.telemetry.emit(
                "agent.tool_round",
                json!({ "round": round + 1, "calls": calls.len() }),
            );

            // Dispatch the whole batch concurrently, then append results in
            // the original request order so the session stays deterministic.
            let results = join_all(calls.iter().map(|call| self.dispatch(call))).await;
            for (call, result_text) in calls.iter().zip(results) {
                session.push_tool(&call.id, &call.function.name, result_text);
            }
        }

        tracing::info!("max tool iterations reached");
        Ok(session
            .last_assistant_text()
            .map(str::to_string)
            .unwrap_or_else(|| BUDGET_EXHAUSTED_ANSWER.to_string()))
    }

    /// Resolve and invoke one requested call. Every failure shape becomes
    /// result text for the model to react to.
    async fn dispatch(&self, call: &ToolCallRequest) -> String {
        let qualified = call.function.name.as_str();
        let Some(tool) = self.tools.get(qualified) else {
            tracing::warn!(tool = %qualified, "model requested an unregistered tool");
            return format!("Error: tool '{qualified}' is not registered.");
        };

        let arguments = parse_tool_arguments(qualified, &call.function.arguments);
        tracing::debug!(tool = %qualified, call_id = %call.id, "invoking tool");

        match self
            .invoker
            .invoke(&tool.server_id, &tool.raw_name, arguments)
            .await
        {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(tool = %qualified, error = %err, "tool invocation failed");
                format!("Error calling tool '{qualified}': {err:#}")
            }
        }
    }

    /// Release every started subprocess. Must run on every exit path of the
    /// owning command.
    pub async fn shutdown(&self) {
        if let Some(transport) = &self.transport {
            transport.close_all().await;
        }
    }
}

/// Arguments must be a JSON object; anything else degrades to empty
/// arguments with a warning rather than failing the call.
pub fn parse_tool_arguments(tool_name: &str, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            tracing::warn!(
                tool = %tool_name,
                kind = %json_kind(&other),
                "tool arguments were not a JSON object; using empty arguments"
            );
            Map::new()
        }
        Err(err) => {
            tracing::warn!(
                tool = %tool_name,
                error = %err,
                "tool arguments were not valid JSON; using empty arguments"
            );
            Map::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
