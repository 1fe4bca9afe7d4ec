use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::{ChatBackend, ChatRequest};
use crate::markers::{GRAD_TAG, MarkerBlock, PLAN_TAG, extract_tagged};
use crate::session::Session;

pub const GRADIENT_SYSTEM_PROMPT: &str = "\
You are the gradient module of an LLM-driven service scanning pipeline. Given \
the current value of a pipeline variable (in text form) and a loss \
description of how scanning failed, produce a directional adjustment for that \
variable inside <Grad> ... </Grad>. Assign an adjustment only to the parts \
that actually caused the loss; for every part that did not, write \"Zero\". \
If the variable as a whole is not responsible, return <Grad> Zero </Grad>.";

pub const OPTIMIZER_SYSTEM_PROMPT: &str = "\
You are the optimizer module of an LLM-driven service scanning pipeline. \
Given a probe plan and a gradient with per-part adjustment suggestions, apply \
every non-Zero suggestion to the corresponding part of the plan, keeping its \
structure and everything else unchanged. Return the full updated plan inside \
<Plan> ... </Plan>. If every part of the gradient is Zero, return the plan \
unchanged.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefineOutcome {
    Updated(String),
    Unchanged,
}

pub fn gradient_prompt(plan: &str, loss: &str) -> String {
    format!(
        "Compute the gradient of the loss with respect to the three components of the \
         probe plan: (1) packet construction, (2) packet sending, (3) response parsing.\n\n\
         Assign a gradient to a component only if it is a root cause of the loss; \
         otherwise mark it \"Zero\".\n\n\
         Probe plan:\n<Plan>\n{plan}\n</Plan>\n\n\
         Loss description:\n<loss>\n{loss}\n</loss>\n\n\
         Return one <Grad> block with the three labelled gradients:\n\
         <Grad>\n\
         Packet Construction Gradient:\n[suggestion or \"Zero\"]\n\n\
         Packet Sending Gradient:\n[suggestion or \"Zero\"]\n\n\
         Response Parsing Gradient:\n[suggestion or \"Zero\"]\n\
         </Grad>"
    )
}

pub fn apply_prompt(plan: &str, gradient: &str) -> String {
    format!(
        "Apply the following gradient to the probe plan. Only change what the non-Zero \
         suggestions call for.\n\n\
         Probe plan:\n<Plan>\n{plan}\n</Plan>\n\n\
         Gradient:\n<Grad>\n{gradient}\n</Grad>\n\n\
         Return the updated plan inside <Plan> ... </Plan>."
    )
}

/// A gradient is zero when every payload line (not a `...:` header) reads
/// "Zero".
pub fn gradient_is_zero(gradient: &str) -> bool {
    let mut saw_payload = false;
    for line in gradient.lines() {
        let line = line.trim().trim_matches(|c| c == '[' || c == ']');
        if line.is_empty() || line.ends_with(':') {
            continue;
        }
        saw_payload = true;
        if !line.eq_ignore_ascii_case("zero") {
            return false;
        }
    }
    saw_payload
}

async fn complete_text(
    backend: &Arc<dyn ChatBackend>,
    model: &str,
    temperature: f32,
    system_prompt: &str,
    prompt: String,
) -> Result<String> {
    let mut session = Session::new(system_prompt);
    session.push_user(prompt);

    let completion = backend
        .complete(&ChatRequest {
            model: model.to_string(),
            messages: session.turns().to_vec(),
            temperature,
            tools: None,
            tool_choice: None,
        })
        .await
        .context("refinement backend call failed")?;

    completion
        .content
        .context("refinement backend returned no textual content")
}

/// One gradient/apply pass: ask for a directional adjustment, and when it is
/// non-Zero, ask for the plan with the adjustment applied. A missing block at
/// either step means "no change", not an error.
pub async fn refine_plan(
    backend: &Arc<dyn ChatBackend>,
    model: &str,
    temperature: f32,
    plan: &str,
    loss: &str,
) -> Result<RefineOutcome> {
    let gradient_reply = complete_text(
        backend,
        model,
        temperature,
        GRADIENT_SYSTEM_PROMPT,
        gradient_prompt(plan, loss),
    )
    .await?;

    let gradient = match extract_tagged(&gradient_reply, GRAD_TAG) {
        MarkerBlock::Present(gradient) => gradient,
        MarkerBlock::Absent => {
            tracing::warn!("gradient reply carried no closed gradient block; plan unchanged");
            return Ok(RefineOutcome::Unchanged);
        }
    };

    if gradient_is_zero(&gradient) {
        tracing::info!("gradient is zero; plan unchanged");
        return Ok(RefineOutcome::Unchanged);
    }

    let apply_reply = complete_text(
        backend,
        model,
        temperature,
        OPTIMIZER_SYSTEM_PROMPT,
        apply_prompt(plan, &gradient),
    )
    .await?;

    match extract_tagged(&apply_reply, PLAN_TAG) {
        MarkerBlock::Present(updated) => Ok(RefineOutcome::Updated(updated)),
        MarkerBlock::Absent => {
            tracing::warn!("optimizer reply carried no closed plan block; plan unchanged");
            Ok(RefineOutcome::Unchanged)
        }
    }
}
