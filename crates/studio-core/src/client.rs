//! HTTP client for OpenAI-compatible model servers

use std::collections::HashSet;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{Result, StudioError};
use crate::stream::{decode_sse, with_cancellation, ChatStream};
use crate::types::{CompletionRequest, CompletionResponse, Message, ModelsResponse, ResponseFormat};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Server reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Server answers the model listing
    Running,
    /// Server is unreachable or unhealthy
    Stopped,
}

/// Client for a local OpenAI-compatible server
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct StudioClient {
    base_url: String,
    api_key: String,
    default_model: Option<String>,
    auto_select_first_model: bool,
    request_timeout: Duration,
    model_fetch_timeout: Duration,
    client: reqwest::Client,
}

impl StudioClient {
    /// Create a client from server settings
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StudioError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            default_model: config.default_model.clone(),
            auto_select_first_model: config.auto_select_first_model,
            request_timeout: config.request_timeout(),
            model_fetch_timeout: config.model_fetch_timeout(),
            client,
        })
    }

    /// Create a client with default settings for the given base URL
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::new(&ServerConfig {
            base_url: base_url.into(),
            ..ServerConfig::default()
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Check if the server answers
    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Get current status
    pub async fn status(&self) -> ServerStatus {
        if self.health_check().await {
            ServerStatus::Running
        } else {
            ServerStatus::Stopped
        }
    }

    /// List model ids, de-duplicated and in server order
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let timeout = self.model_fetch_timeout;
        let response = self
            .client
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| StudioError::from_reqwest(e, timeout))?;

        let listing: ModelsResponse = decode(response, timeout).await?;

        let mut seen = HashSet::new();
        let models: Vec<String> = listing
            .data
            .into_iter()
            .map(|m| m.id.trim().to_string())
            .filter(|id| !id.is_empty())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        debug!(count = models.len(), "Listed models");
        Ok(models)
    }

    /// Pick the model to use: explicit choice, configured default, then the first listed model
    pub async fn resolve_model(&self, preferred: Option<&str>) -> Result<String> {
        if let Some(model) = preferred.or(self.default_model.as_deref()) {
            return Ok(model.to_string());
        }

        if !self.auto_select_first_model {
            return Err(StudioError::InvalidRequest(
                "no model configured and auto-selection is disabled".to_string(),
            ));
        }

        let models = self.list_models().await?;
        match models.into_iter().next() {
            Some(model) => {
                info!(model = %model, "No model configured, using first available");
                Ok(model)
            }
            None => Err(StudioError::NoModelsLoaded),
        }
    }

    /// Send one non-streaming chat completion
    #[instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    pub async fn complete_chat(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if request.stream {
            return Err(StudioError::InvalidRequest(
                "streaming requests must use stream_chat".to_string(),
            ));
        }

        let timeout = self.request_timeout;
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| StudioError::from_reqwest(e, timeout))?;

        let completion: CompletionResponse = decode(response, timeout).await?;
        if completion.choices.is_empty() {
            return Err(StudioError::Serialization(
                "response contained no choices".to_string(),
            ));
        }

        debug!(
            tool_calls = completion.tool_calls().len(),
            usage = ?completion.usage,
            "Chat completion received"
        );
        Ok(completion)
    }

    /// [`Self::complete_chat`], abandoned as soon as `cancel` fires
    pub async fn complete_chat_until(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Chat completion cancelled");
                Err(StudioError::Cancelled)
            }
            result = self.complete_chat(request) => result,
        }
    }

    /// Start a streaming chat completion
    ///
    /// The request timeout covers the response headers only; the body is
    /// read for as long as the server keeps sending.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn stream_chat(&self, request: &CompletionRequest) -> Result<ChatStream> {
        let mut request = request.clone();
        request.stream = true;

        let timeout = self.request_timeout;
        let send = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send();

        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| StudioError::Timeout(timeout))?
            .map_err(|e| StudioError::from_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StudioError::from_status(status, body));
        }

        Ok(decode_sse(response.bytes_stream()))
    }

    /// [`Self::stream_chat`] that ends, closing the connection, when `cancel` fires
    pub async fn stream_chat_until(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(StudioError::Cancelled),
            result = self.stream_chat(request) => result?,
        };
        Ok(with_cancellation(stream, cancel))
    }

    /// One-shot prompt returning the assistant text
    pub async fn chat(&self, model: &str, prompt: &str) -> Result<String> {
        let request = CompletionRequest::new(model, vec![Message::user(prompt)]);
        let response = self.complete_chat(&request).await?;
        Ok(response.content().to_string())
    }

    /// Request output matching `schema` and deserialize it into `T`
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        request: CompletionRequest,
        schema_name: &str,
        schema: Value,
    ) -> Result<T> {
        let request = request.with_response_format(ResponseFormat::json_schema(schema_name, schema));
        let response = self.complete_chat(&request).await?;

        serde_json::from_str(response.content()).map_err(|e| {
            StudioError::Serialization(format!("Structured output did not match schema: {}", e))
        })
    }
}

/// Check the status and decode a JSON body
async fn decode<T: DeserializeOwned>(response: reqwest::Response, timeout: Duration) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StudioError::from_status(status, body));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| StudioError::from_reqwest(e, timeout))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| StudioError::Serialization(format!("Failed to parse response: {}", e)))
}
