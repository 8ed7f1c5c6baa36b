//! Two-round tool-use workflow
//!
//! 1. Send the conversation with tool definitions.
//! 2. If the model answers without tool calls, that answer is final.
//! 3. Otherwise run every requested call in order and append one tool
//!    reply per call, failed or not.
//! 4. Re-send the conversation without tools to get the final answer.
//!
//! Handler failures are recorded per call; only transport failures abort.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::StudioClient;
use crate::conversation::Conversation;
use crate::error::{ErrorKind, Result, StudioError};
use crate::fallback::FallbackParser;
use crate::tools::registry::ToolRegistry;
use crate::types::{CompletionRequest, Message, Role, ToolCall, Usage, DEFAULT_TEMPERATURE};

const CANCELLED_REPLY: &str = "Tool execution cancelled";

/// Model and sampling options for a workflow run
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl WorkflowOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Outcome of running one tool call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedToolCall {
    pub tool_call: ToolCall,
    pub result: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutedToolCall {
    fn succeeded(tool_call: ToolCall, result: String) -> Self {
        Self {
            tool_call,
            result,
            success: true,
            error_message: None,
        }
    }

    fn failed(tool_call: ToolCall, message: String) -> Self {
        Self {
            tool_call,
            result: String::new(),
            success: false,
            error_message: Some(message),
        }
    }

    /// Text sent back to the model as the tool reply
    pub fn reply_text(&self) -> String {
        match self.error_message {
            Some(ref message) if !self.success => format!("Tool execution failed: {}", message),
            _ => self.result.clone(),
        }
    }

    /// The failure as a typed error, if the call failed
    pub fn error(&self) -> Option<StudioError> {
        if self.success {
            return None;
        }
        Some(StudioError::ToolExecution {
            tool: self.tool_call.name().to_string(),
            message: self.error_message.clone().unwrap_or_default(),
        })
    }
}

/// Result of one workflow invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub final_response: String,
    pub executed_tool_calls: Vec<ExecutedToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
    pub total_usage: Usage,
}

impl WorkflowResult {
    fn completed(final_response: String, executed: Vec<ExecutedToolCall>, usage: Usage) -> Self {
        Self {
            success: true,
            final_response,
            executed_tool_calls: executed,
            error_message: None,
            error_kind: None,
            total_usage: usage,
        }
    }

    fn aborted(err: StudioError, executed: Vec<ExecutedToolCall>, usage: Usage) -> Self {
        Self {
            success: false,
            final_response: String::new(),
            executed_tool_calls: executed,
            error_message: Some(err.to_string()),
            error_kind: Some(err.kind()),
            total_usage: usage,
        }
    }
}

/// Drives the tool-use exchange against one client
#[derive(Debug, Clone)]
pub struct ToolWorkflow {
    client: StudioClient,
    options: WorkflowOptions,
}

impl ToolWorkflow {
    pub fn new(client: StudioClient, options: WorkflowOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// Run the workflow using only the structured tool-call channel
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        registry: &ToolRegistry,
        cancel: &CancellationToken,
    ) -> WorkflowResult {
        self.run_with_fallback(conversation, registry, None, cancel)
            .await
    }

    /// Run the workflow, recovering tool calls from the reply text with
    /// `fallback` when the model returns none
    #[instrument(skip_all, fields(model = %self.options.model, tools = registry.len()))]
    pub async fn run_with_fallback(
        &self,
        conversation: &mut Conversation,
        registry: &ToolRegistry,
        fallback: Option<&FallbackParser>,
        cancel: &CancellationToken,
    ) -> WorkflowResult {
        let mut usage = Usage::default();
        let mut executed = Vec::new();

        match self
            .drive(conversation, registry, fallback, cancel, &mut usage, &mut executed)
            .await
        {
            Ok(final_response) => {
                info!(
                    tool_calls = executed.len(),
                    total_tokens = usage.total_tokens,
                    "Workflow completed"
                );
                WorkflowResult::completed(final_response, executed, usage)
            }
            Err(e) => {
                warn!(error = %e, tool_calls = executed.len(), "Workflow failed");
                WorkflowResult::aborted(e, executed, usage)
            }
        }
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        registry: &ToolRegistry,
        fallback: Option<&FallbackParser>,
        cancel: &CancellationToken,
        usage: &mut Usage,
        executed: &mut Vec<ExecutedToolCall>,
    ) -> Result<String> {
        let request = self.request(conversation).with_tools(registry.definitions());
        let mut message = self.round_trip(&request, cancel, usage).await?;

        let mut calls = message.requested_tool_calls().to_vec();
        if calls.is_empty() {
            if let Some(parser) = fallback {
                calls = parser.detect(message.text(), registry);
                if !calls.is_empty() {
                    info!(count = calls.len(), "Recovered tool calls from reply text");
                    message.tool_calls = Some(calls.clone());
                }
            }
        }

        if calls.is_empty() {
            debug!("No tool calls requested");
            let content = message.text().to_string();
            conversation.append_assistant_message(message)?;
            return Ok(content);
        }

        conversation.append_assistant_message(message)?;
        self.execute_calls(&calls, conversation, registry, cancel, executed)
            .await?;

        // Tools are omitted so the model has to answer in text
        let request = self.request(conversation);
        let mut message = self.round_trip(&request, cancel, usage).await?;
        message.tool_calls = None;

        let content = message.text().to_string();
        conversation.append_assistant_message(message)?;
        Ok(content)
    }

    fn request(&self, conversation: &Conversation) -> CompletionRequest {
        conversation.to_request(
            self.options.model.clone(),
            self.options.temperature,
            self.options.max_tokens,
            false,
        )
    }

    async fn round_trip(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        usage: &mut Usage,
    ) -> Result<Message> {
        let response = self.client.complete_chat_until(request, cancel).await?;
        *usage += response.usage();

        let mut message = response
            .message()
            .cloned()
            .ok_or_else(|| StudioError::Serialization("response contained no choices".to_string()))?;
        message.role = Role::Assistant;
        Ok(message)
    }

    /// Run calls one at a time in the order the model listed them
    async fn execute_calls(
        &self,
        calls: &[ToolCall],
        conversation: &mut Conversation,
        registry: &ToolRegistry,
        cancel: &CancellationToken,
        executed: &mut Vec<ExecutedToolCall>,
    ) -> Result<()> {
        for (i, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                // Every request still gets a reply so the log stays well-formed
                for skipped in &calls[i..] {
                    conversation.append_tool(CANCELLED_REPLY, &skipped.id)?;
                }
                return Err(StudioError::Cancelled);
            }

            let outcome = execute_call(call, registry).await;
            conversation.append_tool(outcome.reply_text(), &call.id)?;
            executed.push(outcome);
        }
        Ok(())
    }
}

async fn execute_call(call: &ToolCall, registry: &ToolRegistry) -> ExecutedToolCall {
    let Some(handler) = registry.handler(call.name()) else {
        warn!(tool = %call.name(), "Tool not found");
        return ExecutedToolCall::failed(call.clone(), format!("Tool not found: {}", call.name()));
    };

    info!(tool = %call.name(), id = %call.id, "Executing tool");
    match handler.call(call.arguments()).await {
        Ok(result) => {
            info!(tool = %call.name(), output_len = result.len(), "Tool executed successfully");
            ExecutedToolCall::succeeded(call.clone(), result)
        }
        Err(e) => {
            warn!(tool = %call.name(), error = %e, "Tool execution failed");
            ExecutedToolCall::failed(call.clone(), e.to_string())
        }
    }
}
