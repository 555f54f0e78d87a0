use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub chat: ChatConfig,
}

/// OpenRouter (OpenAI-compatible) API configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Defaults applied to chat completions
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub default_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Content of the root system message when a chat is started without one.
    pub system_prompt: String,
}

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "anthropic/claude-3-haiku";

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let llm = LlmConfig {
            api_key: env::var("OPENROUTER_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            base_url: env::var("OPENROUTER_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/chat.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = RequestConfig::default();
        let request = RequestConfig {
            timeout_ms: parse_var("REQUEST_TIMEOUT_MS").unwrap_or(defaults.timeout_ms),
            max_retries: parse_var("MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_delay_ms: parse_var("RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
        };

        let chat_defaults = ChatConfig::default();
        let chat = ChatConfig {
            default_model: env::var("CHAT_DEFAULT_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(chat_defaults.default_model),
            temperature: parse_var("CHAT_TEMPERATURE").unwrap_or(chat_defaults.temperature),
            max_tokens: parse_var("CHAT_MAX_TOKENS").unwrap_or(chat_defaults.max_tokens),
            system_prompt: env::var("CHAT_SYSTEM_PROMPT").unwrap_or(chat_defaults.system_prompt),
        };

        if !(0.0..=2.0).contains(&chat.temperature) {
            return Err(AppError::Config {
                message: format!(
                    "CHAT_TEMPERATURE must be between 0.0 and 2.0, got {}",
                    chat.temperature
                ),
            });
        }

        Ok(Config {
            llm,
            database,
            logging,
            request,
            chat,
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60000,
            max_retries: 0,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            system_prompt: String::new(),
        }
    }
}
