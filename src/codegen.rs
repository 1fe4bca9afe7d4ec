use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::{ChatBackend, ChatRequest};
use crate::session::Session;

pub const CODEGEN_SYSTEM_PROMPT: &str =
    "You are an experienced network service Go developer.";

pub fn outline_prompt(service: &str, doc_extract: &str) -> String {
    format!(
        "Here is part of the documentation of {service}:\n\
         <doc>\n{doc_extract}\n</doc>\n\n\
         Follow these steps to design the {service} scanning plugin:\n\n\
         1. Restate the goal: the plugin does not establish a fully valid session; it \
         elicits as many service-specific messages from the server as possible, using \
         our IP and port, the server IP and port, and any user-supplied header fields.\n\n\
         2. Decide which of two situations applies. If the protocol has the server speak \
         first, wait for its message after connecting and validate its format against the \
         documentation. If the client speaks first, construct a message that forces a \
         response, or one that triggers an error reply unique to {service}. Either a valid \
         response or a protocol-specific error confirms the service; always include the raw \
         server bytes in the plugin output.\n\n\
         3. Select the message types to send and receive to extract as much information \
         from the server as possible, and give the execution logic for them.\n\n\
         4. Provide the exact formats of the messages to send and receive, including \
         possible error responses.\n\n\
         5. Synthesize the steps above into a coding outline detailed enough that an \
         experienced programmer can implement the complete plugin from the outline alone.\n\n\
         Please start now."
    )
}

pub fn plugin_prompt(service: &str, example_code: &str, outline: &str) -> String {
    format!(
        "Here is the example code of an existing scanning plugin of our tool. Read it \
         carefully first.\n\
         <code>\n{example_code}\n</code>\n\n\
         Now implement the {service} scanning plugin in Go in the same shape. The tool \
         calls the plugin's Scan function to start the scan. Prefer the existing helper \
         functions visible in the example over writing new ones of similar purpose.\n\n\
         Implementation steps:\n\
         <steps>\n{outline}\n</steps>"
    )
}

async fn complete_text(
    backend: &Arc<dyn ChatBackend>,
    model: &str,
    temperature: f32,
    prompt: String,
) -> Result<String> {
    let session = {
        let mut session = Session::new(CODEGEN_SYSTEM_PROMPT);
        session.push_user(prompt);
        session
    };

    let completion = backend
        .complete(&ChatRequest {
            model: model.to_string(),
            messages: session.turns().to_vec(),
            temperature,
            tools: None,
            tool_choice: None,
        })
        .await
        .context("code generation backend call failed")?;

    completion
        .content
        .filter(|content| !content.trim().is_empty())
        .context("code generation backend returned no textual content")
}

pub async fn generate_outline(
    backend: &Arc<dyn ChatBackend>,
    model: &str,
    temperature: f32,
    service: &str,
    doc_extract: &str,
) -> Result<String> {
    complete_text(
        backend,
        model,
        temperature,
        outline_prompt(service, doc_extract),
    )
    .await
}

pub async fn generate_plugin(
    backend: &Arc<dyn ChatBackend>,
    model: &str,
    temperature: f32,
    service: &str,
    example_code: &str,
    outline: &str,
) -> Result<String> {
    complete_text(
        backend,
        model,
        temperature,
        plugin_prompt(service, example_code, outline),
    )
    .await
}
