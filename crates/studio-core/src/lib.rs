//! studio-core: Client library for local OpenAI-compatible LLM servers
//!
//! Provides:
//! - Configuration loading (studio.toml)
//! - HTTP client for chat completions and model listing (with streaming support)
//! - Conversation log and request building
//! - Tool registry and the two-round tool-use workflow
//! - Fallback tool-call parsing for models that answer in prose

pub mod agent;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod fallback;
pub mod stream;
pub mod tools;
pub mod types;
pub mod workflow;

pub use agent::Agent;
pub use client::{ServerStatus, StudioClient};
pub use config::{ChatConfig, Config, ServerConfig};
pub use conversation::Conversation;
pub use error::{ErrorKind, Result, StudioError};
pub use fallback::{FallbackParser, KeywordRule, Trigger};
pub use stream::{ChatStream, StreamAccumulator};
pub use tools::registry::ToolRegistry;
pub use tools::{FnHandler, ParameterProperty, ParameterSchema, ToolHandler};
pub use types::{
    CompletionRequest, CompletionResponse, FunctionCall, FunctionDefinition, JsonSchemaFormat,
    Message, MessageDelta, ModelInfo, ResponseFormat, Role, StreamingChunk, ToolCall,
    ToolDefinition, Usage,
};
pub use workflow::{ExecutedToolCall, ToolWorkflow, WorkflowOptions, WorkflowResult};
