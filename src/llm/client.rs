use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionOptions, LlmReply,
};
use super::LlmResponder;
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{LlmError, LlmResult};
use crate::tree::Message;

/// Client for an OpenAI-compatible chat completions API (OpenRouter by default)
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
}

impl OpenRouterClient {
    /// Create a new client; fails when no API key is configured
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> LlmResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| LlmError::Configuration {
                message: "OPENROUTER_API_KEY is required".to_string(),
            })?;

        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            request_config,
        })
    }

    /// Run a chat completion, retrying transient failures
    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> LlmResult<ChatCompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                let delay = backoff_delay(self.request_config.retry_delay_ms, attempt);
                warn!(
                    model = %request.model,
                    retry = attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying chat completion"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match self.execute_request(&url, request).await {
                Ok(response) => {
                    info!(
                        model = %request.model,
                        latency_ms = start.elapsed().as_millis(),
                        "Chat completion succeeded"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    error!(
                        model = %request.model,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = attempt,
                        "Chat completion failed"
                    );
                    if !e.is_retryable() || attempt >= self.request_config.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Execute a single request (internal)
    async fn execute_request(
        &self,
        url: &str,
        request: &ChatCompletionRequest,
    ) -> LlmResult<ChatCompletionResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Calling chat completions"
        );

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LlmResponder for OpenRouterClient {
    async fn respond(&self, path: &[Message], options: &CompletionOptions) -> LlmResult<LlmReply> {
        let mut request = ChatCompletionRequest::new(&options.model, path);
        if let Some(temperature) = options.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.complete(&request).await?;
        LlmReply::from_response(response, &options.model)
    }
}

/// Exponential backoff before retry number `attempt` (1-based), saturating
/// instead of overflowing for large retry counts.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}
