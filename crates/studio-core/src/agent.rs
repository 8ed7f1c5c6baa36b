//! Conversational agent with tools
//!
//! Bundles a client, a conversation, a tool registry and the selected model,
//! and recovers tool calls from prose for models that ignore the structured
//! tool channel.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::client::StudioClient;
use crate::config::Config;
use crate::conversation::Conversation;
use crate::error::Result;
use crate::fallback::FallbackParser;
use crate::tools::registry::ToolRegistry;
use crate::workflow::{ToolWorkflow, WorkflowOptions, WorkflowResult};

pub struct Agent {
    client: StudioClient,
    conversation: Conversation,
    registry: ToolRegistry,
    options: WorkflowOptions,
    fallback: Option<FallbackParser>,
}

impl Agent {
    /// Create an agent for `model` with an empty conversation and no tools
    pub fn new(client: StudioClient, model: impl Into<String>) -> Self {
        Self {
            client,
            conversation: Conversation::new(None),
            registry: ToolRegistry::new(),
            options: WorkflowOptions::new(model),
            fallback: Some(FallbackParser::new()),
        }
    }

    /// Create an agent from configuration, resolving the model on the server
    pub async fn connect(config: &Config, model: Option<&str>) -> Result<Self> {
        let client = StudioClient::new(&config.server)?;
        let model = client.resolve_model(model).await?;
        info!(model = %model, base_url = %client.base_url(), "Agent connected");

        Ok(Self::new(client, model)
            .with_temperature(config.chat.temperature)
            .with_max_tokens(config.chat.max_tokens)
            .with_system_prompt(config.chat.system_prompt.clone()))
    }

    /// Replace the conversation with one seeded by `prompt`
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.conversation = Conversation::new(prompt);
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.options.max_tokens = max_tokens;
        self
    }

    /// Set the parser used when the model answers without tool calls;
    /// `None` disables recovery
    pub fn with_fallback(mut self, fallback: Option<FallbackParser>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn model(&self) -> &str {
        &self.options.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.options.model = model.into();
    }

    pub fn client(&self) -> &StudioClient {
        &self.client
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Swap in another conversation, e.g. one loaded from disk
    pub fn replace_conversation(&mut self, conversation: Conversation) -> Conversation {
        std::mem::replace(&mut self.conversation, conversation)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Clear the conversation back to its system prompt
    pub fn reset(&mut self) {
        self.conversation.clear();
    }

    /// Send a user message and run the tool workflow on it
    #[instrument(skip_all, fields(model = %self.options.model))]
    pub async fn send(&mut self, text: &str, cancel: &CancellationToken) -> WorkflowResult {
        self.conversation.append_user(text);

        let workflow = ToolWorkflow::new(self.client.clone(), self.options.clone());
        workflow
            .run_with_fallback(
                &mut self.conversation,
                &self.registry,
                self.fallback.as_ref(),
                cancel,
            )
            .await
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.options.model)
            .field("messages", &self.conversation.len())
            .field("registry", &self.registry)
            .finish()
    }
}
