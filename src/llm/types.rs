use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::tree::{Message, Role};

/// Message as sent to an OpenAI-compatible chat endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role(),
            content: message.content().to_string(),
        }
    }
}

/// Request body for `POST /chat/completions`
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Provider default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatCompletionRequest {
    /// Build a request from a root-first conversation path
    pub fn new(model: impl Into<String>, path: &[Message]) -> Self {
        Self {
            model: model.into(),
            messages: path.iter().map(ChatMessage::from).collect(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set temperature
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Response body from `POST /chat/completions`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

/// One completion choice
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Option<ChoiceMessage>,
    pub finish_reason: Option<String>,
}

/// Message payload inside a choice
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceMessage {
    pub role: Option<String>,
    pub content: Option<String>,
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Parameters for a single completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl CompletionOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Reply content plus the metadata persisted alongside the assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmReply {
    pub content: String,
    pub usage: Usage,
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub finish_reason: Option<String>,
    pub raw_response_id: Option<String>,
}

impl LlmReply {
    /// Extract the first choice of a completion response.
    ///
    /// A response without choices is invalid; a choice without content yields
    /// an empty reply rather than an error.
    pub fn from_response(
        response: ChatCompletionResponse,
        requested_model: &str,
    ) -> Result<Self, LlmError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "response contained no choices".to_string(),
            })?;

        Ok(Self {
            content: choice
                .message
                .and_then(|m| m.content)
                .unwrap_or_default(),
            usage: response.usage.unwrap_or_default(),
            provider: response.provider,
            model_name: response.model.or_else(|| Some(requested_model.to_string())),
            finish_reason: choice.finish_reason,
            raw_response_id: response.id,
        })
    }
}
