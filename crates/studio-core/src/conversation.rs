//! Conversation log
//!
//! An append-only sequence of role-tagged messages that is materialized into
//! each outbound request. The system prompt, when configured, is always the
//! first message.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StudioError};
use crate::types::{CompletionRequest, Message, Role, ToolCall};

const TITLE_LEN: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    system_prompt: Option<String>,
    messages: Vec<Message>,
}

impl Conversation {
    /// Create a conversation, seeding the system prompt if given
    pub fn new(system_prompt: Option<String>) -> Self {
        let mut conversation = Self {
            system_prompt,
            messages: Vec::new(),
        };
        conversation.seed();
        conversation
    }

    fn seed(&mut self) {
        if let Some(ref system) = self.system_prompt {
            self.messages.push(Message::system(system.clone()));
        }
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(Message::assistant(text));
    }

    pub fn append_assistant_with_tool_calls(&mut self, calls: Vec<ToolCall>) {
        self.messages.push(Message::assistant_with_tool_calls(calls));
    }

    /// Record an assistant message as returned by the model
    pub fn append_assistant_message(&mut self, message: Message) -> Result<()> {
        if message.role != Role::Assistant {
            return Err(StudioError::InvalidRequest(format!(
                "expected an assistant message, got {}",
                message.role
            )));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Append a tool reply
    ///
    /// The id must belong to a tool call an earlier assistant message made.
    pub fn append_tool(&mut self, text: impl Into<String>, tool_call_id: &str) -> Result<()> {
        if !self.has_tool_call(tool_call_id) {
            return Err(StudioError::InvalidRequest(format!(
                "no assistant tool call with id '{}'",
                tool_call_id
            )));
        }
        self.messages.push(Message::tool(text, tool_call_id));
        Ok(())
    }

    fn has_tool_call(&self, id: &str) -> bool {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.requested_tool_calls())
            .any(|c| c.id == id)
    }

    /// Snapshot the log into a request; the log itself is untouched
    pub fn to_request(
        &self,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: Option<u32>,
        stream: bool,
    ) -> CompletionRequest {
        CompletionRequest::new(model, self.messages.clone())
            .with_temperature(temperature)
            .with_max_tokens(max_tokens)
            .with_stream(stream)
    }

    /// Drop everything except the configured system prompt
    pub fn clear(&mut self) {
        self.messages.clear();
        self.seed();
    }

    /// The last `count` messages
    pub fn last_n(&self, count: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    /// Messages other than system messages
    pub fn without_system(&self) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Short title taken from the first user message
    pub fn title(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| truncate_title(m.text()))
    }

    /// Save the conversation as pretty-printed JSON
    pub fn save_to(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write conversation to {}", path.display()))
    }

    /// Load a conversation saved with [`Conversation::save_to`]
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Conversation not found: {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse conversation")
    }
}

/// Truncate content to a reasonable title length
fn truncate_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or(content);
    let cleaned: String = first_line
        .chars()
        .filter(|c| !c.is_control())
        .take(TITLE_LEN)
        .collect();

    if cleaned.len() < first_line.len() {
        format!("{}...", cleaned.trim())
    } else {
        cleaned.trim().to_string()
    }
}
