use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use rig::completion::{CompletionError, CompletionModel};
use rig::prelude::CompletionClient;
use rig::providers::together;
use rig::streaming::StreamedAssistantContent;
use tracing::{debug, error};

use crate::config::TextSettings;
use crate::errors::AppError;

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

/// Upstream failures carry no usable status through the client, so they are
/// reported as a bad gateway.
const UNKNOWN_UPSTREAM_STATUS: u16 = 502;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatCompletionRequest {
    /// System messages joined into one preamble.
    fn preamble(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The last user message, which is the turn being asked.
    fn prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

/// A streaming chat-completion backend.
#[async_trait]
pub trait TextCompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Opens exactly one provider stream. Credentials are checked before any
    /// network traffic.
    async fn open_stream(&self, request: &ChatCompletionRequest) -> Result<TokenStream, AppError>;
}

/// Streaming client for Together.ai, built on the rig [`together::Client`].
#[derive(Clone)]
pub struct TogetherTextProvider {
    base_url: String,
    api_key: Option<String>,
}

impl TogetherTextProvider {
    pub fn new(settings: &TextSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        }
    }

    fn client(&self, api_key: &str) -> Result<together::Client, AppError> {
        together::Client::builder()
            .api_key(api_key)
            .base_url(&self.base_url)
            .build()
            .map_err(|e| AppError::Unexpected(format!("failed to build Together client: {e}")))
    }
}

#[async_trait]
impl TextCompletionProvider for TogetherTextProvider {
    fn name(&self) -> &str {
        "together"
    }

    async fn open_stream(&self, request: &ChatCompletionRequest) -> Result<TokenStream, AppError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::missing_credentials(self.name()))?;
        let prompt = request
            .prompt()
            .ok_or_else(|| AppError::invalid_input("completion request has no user message"))?;

        debug!("Opening completion stream with model {}", request.model);
        let model = self.client(api_key)?.completion_model(&request.model);
        let response = model
            .completion_request(prompt)
            .preamble(request.preamble())
            .max_tokens(u64::from(request.max_tokens))
            .temperature(f64::from(request.temperature))
            .stream()
            .await
            .map_err(|e| {
                error!("Together stream could not be opened: {e}");
                map_completion_error(e)
            })?;

        let tokens = response.filter_map(|item| async move {
            match item {
                Ok(StreamedAssistantContent::Text(text)) if !text.text.is_empty() => {
                    Some(Ok(text.text))
                }
                Ok(_) => None,
                Err(e) => Some(Err(AppError::stream(e))),
            }
        });
        Ok(Box::pin(tokens))
    }
}

/// Sorts rig failures into the connection/provider split, the same
/// message-based triage the chat agent used.
fn map_completion_error(e: CompletionError) -> AppError {
    let message = e.to_string();
    match e {
        CompletionError::ProviderError(msg) | CompletionError::ResponseError(msg) => {
            AppError::ProviderError { status: UNKNOWN_UPSTREAM_STATUS, message: msg }
        }
        _ if message.contains("Connection refused") || message.contains("connect") => {
            AppError::connection(message)
        }
        _ => AppError::ProviderError { status: UNKNOWN_UPSTREAM_STATUS, message },
    }
}
