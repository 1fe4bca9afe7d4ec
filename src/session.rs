use serde::{Deserialize, Serialize};

use crate::backend::{ChatTurn, Role, ToolCallRequest};

/// Append-only conversation for one run. The system turn is inserted by the
/// constructor and is always first; there is no way to add a second one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    turns: Vec<ChatTurn>,
}

impl Session {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![ChatTurn::system(system_prompt)],
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(ChatTurn::user(content));
    }

    pub fn push_assistant(&mut self, content: Option<String>, tool_calls: Vec<ToolCallRequest>) {
        self.turns.push(ChatTurn::assistant(content, tool_calls));
    }

    pub fn push_tool(
        &mut self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.turns.push(ChatTurn::tool(call_id, tool_name, content));
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Content of the most recent assistant turn that carried text.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|turn| turn.role == Role::Assistant)
            .find_map(|turn| turn.content.as_deref())
            .filter(|content| !content.trim().is_empty())
    }

    /// Content of the latest turn regardless of role.
    pub fn latest_content(&self) -> Option<&str> {
        self.turns.last().and_then(|turn| turn.content.as_deref())
    }
}
