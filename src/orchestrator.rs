use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use crate::backend::{ChatBackend, ChatRequest};
use crate::markers::{MarkerBlock, PLAN_TAG, extract_tagged, parse_planner_turn};
use crate::session::Session;
use crate::telemetry::TelemetrySink;
use crate::tool_agent::ToolAgent;

pub const PLANNER_SYSTEM_PROMPT: &str = "\
You are the probe-plan generator for a network service scanning system.

# Task Definition
The task is to determine whether a specific service is running on a known IP \
address and active port. This is a binary classification task, not a full \
handshake or deep protocol negotiation. Any response that conforms to the \
target service's protocol, including a rejection or error, is sufficient \
evidence that the service is present.

# Probe Plan Rules
The probe plan is a step-wise hierarchical structure:
1. Use a dotted hierarchical index (1, 1.1, 1.1.2) where each node is one \
operation in the probing process, such as establishing a connection, sending \
a packet, or parsing a response.
2. The root node states the overall goal: determining whether the target \
service is running.
3. Each round, expand the plan with the next necessary operations based on \
the current reasoning state.
4. When an operation needs external factual information, such as protocol \
behavior or default packet structures, raise exactly one clarification \
question inside <Task> ... </Task>. It will be answered from reference \
documents only.
5. Do not embed known runtime parameters (IP address, port number, service \
name) in the plan; the scanner receives them separately.

# Output Format
Each round, return only:
- <Plan> ... </Plan>: the current probe plan
- <Task> ... </Task>: only if you need a clarification from the documentation
Omit the <Task> section once the plan is complete.

Specify the full packet structure, with the value and length of each field, \
so the plan can drive deterministic code generation.";

pub const FORMAT_REMINDER: &str = "\n\nNote that the output format is\n\
<Plan> ... </Plan>: the current probe plan\n\
<Task> ... </Task>: only if you need a clarification from the documentation\n";

pub const DEFAULT_TASK_PROMPT: &str = "\
Generate the probe plan for the {service} service.\n\nRequirements:\n{requirements}";

/// Result of a planner run. `Absent` is the explicit sentinel for a final
/// turn without a closed plan block; callers must check for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanExtract {
    Plan(String),
    Absent,
}

impl PlanExtract {
    pub fn as_plan(&self) -> Option<&str> {
        match self {
            PlanExtract::Plan(plan) => Some(plan.as_str()),
            PlanExtract::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, PlanExtract::Absent)
    }
}

#[derive(Debug)]
pub struct PlanRun {
    pub plan: PlanExtract,
    pub rounds_used: usize,
    pub clarifications: usize,
    pub session: Session,
}

pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    model: String,
    temperature: f32,
    telemetry: TelemetrySink,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        model: String,
        temperature: f32,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            backend,
            model,
            temperature,
            telemetry,
        }
    }

    /// Grow the plan over a bounded conversation with the planner model.
    /// Backend failure aborts with the error (no retry). Budget exhaustion is
    /// not a failure: whatever plan the final turn carries is the result.
    pub async fn run(
        &self,
        agent: &ToolAgent,
        task_prompt: &str,
        service: Option<&str>,
        requirements: Option<&str>,
        iteration_budget: usize,
    ) -> Result<PlanRun> {
        let mut session = Session::new(PLANNER_SYSTEM_PROMPT);
        let mut prompt = inject_requirements(task_prompt, service, requirements);
        let mut remaining = iteration_budget.max(1);
        let mut rounds_used = 0usize;
        let mut clarifications = 0usize;

        loop {
            session.push_user(prompt.clone());
            let request = ChatRequest {
                model: self.model.clone(),
                messages: session.turns().to_vec(),
                temperature: self.temperature,
                tools: None,
                tool_choice: None,
            };

            let completion = self
                .backend
                .complete(&request)
                .await
                .context("planner backend call failed")?;
            let content = completion.content.unwrap_or_default();
            session.push_assistant(Some(content.clone()), Vec::new());

            rounds_used += 1;
            remaining -= 1;
            self.telemetry
                .emit("plan.round", json!({ "round": rounds_used }));

            if remaining == 0 {
                tracing::info!(rounds = rounds_used, "plan iteration budget exhausted");
                break;
            }

            let turn = parse_planner_turn(&content);
            let MarkerBlock::Present(question) = turn.clarification else {
                tracing::info!(rounds = rounds_used, "planner raised no clarification");
                break;
            };

            tracing::info!(question = %question, "delegating clarification");
            clarifications += 1;
            let answer = agent.answer(&question).await?;
            self.telemetry.emit(
                "plan.clarification",
                json!({ "round": rounds_used, "answer_chars": answer.len() }),
            );

            prompt = format!("{answer}{FORMAT_REMINDER}");
        }

        let plan = match session
            .last_assistant_text()
            .map(|content| extract_tagged(content, PLAN_TAG))
            .unwrap_or(MarkerBlock::Absent)
        {
            MarkerBlock::Present(plan) => PlanExtract::Plan(plan),
            MarkerBlock::Absent => PlanExtract::Absent,
        };

        self.telemetry.emit(
            "plan.completed",
            json!({
                "rounds": rounds_used,
                "clarifications": clarifications,
                "plan_present": !plan.is_absent()
            }),
        );

        Ok(PlanRun {
            plan,
            rounds_used,
            clarifications,
            session,
        })
    }
}

/// Fill the `{service}` and `{requirements}` placeholders. Requirements with
/// no placeholder to land in are appended as their own section.
pub fn inject_requirements(
    task_prompt: &str,
    service: Option<&str>,
    requirements: Option<&str>,
) -> String {
    let mut prompt = task_prompt.to_string();

    if let Some(service) = service {
        prompt = prompt.replace("{service}", service);
    }

    match requirements {
        Some(requirements) if prompt.contains("{requirements}") => {
            prompt = prompt.replace("{requirements}", requirements);
        }
        Some(requirements) => {
            prompt.push_str("\n\nRequirements:\n");
            prompt.push_str(requirements);
        }
        None => {
            prompt = prompt.replace("{requirements}", "No requirements");
        }
    }

    prompt
}
