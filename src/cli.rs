//! Command-line interface.
//!
//! Thin wiring over [`ChatService`] and [`UserRepository`]: every command
//! prints JSON on success and a one-line error otherwise.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::access::User;
use crate::chat::{ChatService, SendOptions};
use crate::config::Config;
use crate::error::{AppError, AppResult, LlmError, LlmResult, StorageError};
use crate::llm::{CompletionOptions, LlmReply, LlmResponder, OpenRouterClient};
use crate::storage::{SqliteStorage, UserRepository};
use crate::tree::Message;

/// Branching LLM chats stored in SQLite.
#[derive(Parser, Debug)]
#[command(name = "branching-chat", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Provision and manage users
    #[command(subcommand)]
    User(UserCommands),

    /// Start, inspect and continue chats
    Chat {
        /// Username of the acting user
        #[arg(long, short)]
        user: String,

        #[command(subcommand)]
        command: ChatCommands,
    },
}

/// User administration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommands {
    /// Create a new active user
    Create { username: String, email: String },

    /// Disable a user; they lose access to all their chats
    Disable { username: String },

    /// Re-enable a disabled user
    Enable { username: String },

    /// List all users
    List,
}

/// Chat subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ChatCommands {
    /// Start a new chat
    Start {
        /// System prompt for the root message (defaults to CHAT_SYSTEM_PROMPT)
        #[arg(long)]
        system: Option<String>,
    },

    /// List your chats, most recently updated first
    List,

    /// Print a chat as a nested tree
    Show { tree_id: String },

    /// Send a message and print the exchange
    Send {
        tree_id: String,

        /// Message to reply to; may be omitted for the first reply
        #[arg(long)]
        parent: Option<String>,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        temperature: Option<f64>,

        #[arg(long)]
        max_tokens: Option<u32>,

        content: String,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }

    fn json(value: &impl Serialize) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(text) => Self::success(text),
            Err(e) => Self::error(format!("Failed to serialize output: {}", e)),
        }
    }

    /// Chat failures print only the public message; a chat owned by someone
    /// else reads exactly like a missing one. The full error goes to the log.
    fn from_app(result: AppResult<CliResult>) -> Self {
        result.unwrap_or_else(|e| {
            warn!(error = %e, kind = ?e.kind(), "Chat command failed");
            Self::error(format!("Error: {}", e.public_message()))
        })
    }

    /// User administration failures are printed in full for the operator.
    fn from_admin(result: AppResult<CliResult>) -> Self {
        result.unwrap_or_else(|e| Self::error(format!("Error: {}", e)))
    }
}

/// Execute a CLI command.
pub async fn execute_command(command: Commands, storage: &SqliteStorage, config: &Config) -> CliResult {
    match command {
        Commands::User(command) => CliResult::from_admin(execute_user(command, storage).await),
        Commands::Chat { user, command } => {
            CliResult::from_app(execute_chat(&user, command, storage, config).await)
        }
    }
}

async fn execute_user(command: UserCommands, storage: &SqliteStorage) -> AppResult<CliResult> {
    match command {
        UserCommands::Create { username, email } => {
            let user = User::new(username, email);
            storage.create_user(&user).await?;
            Ok(CliResult::json(&user))
        }
        UserCommands::Disable { username } => set_active(storage, &username, false).await,
        UserCommands::Enable { username } => set_active(storage, &username, true).await,
        UserCommands::List => Ok(CliResult::json(&storage.list_users().await?)),
    }
}

async fn set_active(storage: &SqliteStorage, username: &str, is_active: bool) -> AppResult<CliResult> {
    let user = lookup_user(storage, username).await?;
    storage.set_user_active(&user.id, is_active).await?;
    Ok(CliResult::json(&json!({
        "id": user.id,
        "username": user.username,
        "is_active": is_active,
    })))
}

async fn lookup_user(storage: &SqliteStorage, username: &str) -> AppResult<User> {
    storage
        .find_user_by_username(username)
        .await?
        .ok_or_else(|| {
            StorageError::UserNotFound {
                user_id: username.to_string(),
            }
            .into()
        })
}

async fn execute_chat(
    username: &str,
    command: ChatCommands,
    storage: &SqliteStorage,
    config: &Config,
) -> AppResult<CliResult> {
    let actor = lookup_user(storage, username).await?;

    match OpenRouterClient::new(&config.llm, config.request.clone()) {
        Ok(client) => {
            let service = ChatService::new(storage.clone(), client, config.chat.clone());
            run_chat(&service, &actor, command).await
        }
        // Sending needs the model; fail before the user message is saved
        Err(e) if matches!(command, ChatCommands::Send { .. }) => Err(e.into()),
        Err(e) => {
            let responder = Unavailable {
                reason: e.to_string(),
            };
            let service = ChatService::new(storage.clone(), responder, config.chat.clone());
            run_chat(&service, &actor, command).await
        }
    }
}

async fn run_chat<L: LlmResponder>(
    service: &ChatService<SqliteStorage, L>,
    actor: &User,
    command: ChatCommands,
) -> AppResult<CliResult> {
    match command {
        ChatCommands::Start { system } => {
            let tree = service.start_chat(actor, system.as_deref()).await?;
            let root_id = tree.root().map(|node| node.message().id().to_string());
            Ok(CliResult::json(&json!({
                "tree_id": tree.id(),
                "root_message_id": root_id,
            })))
        }
        ChatCommands::List => Ok(CliResult::json(&service.list_chats(actor).await?)),
        ChatCommands::Show { tree_id } => {
            Ok(CliResult::json(&service.chat_view(actor, &tree_id).await?))
        }
        ChatCommands::Send {
            tree_id,
            parent,
            model,
            temperature,
            max_tokens,
            content,
        } => {
            let options = send_options(service.default_send_options(), model, temperature, max_tokens)?;
            let exchange = service
                .send_to_chat(actor, &tree_id, parent.as_deref(), &content, &options)
                .await?;
            Ok(CliResult::json(&exchange))
        }
    }
}

fn send_options(
    mut options: SendOptions,
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
) -> AppResult<SendOptions> {
    if let Some(model) = model {
        options = options.with_model(model);
    }
    if let Some(temperature) = temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(AppError::Config {
                message: format!("temperature must be between 0.0 and 2.0, got {}", temperature),
            });
        }
        options = options.with_temperature(temperature);
    }
    if let Some(max_tokens) = max_tokens {
        options = options.with_max_tokens(max_tokens);
    }
    Ok(options)
}

/// Stands in for the client when no API key is configured, so commands that
/// never reach the model still work. `chat send` never runs with it.
struct Unavailable {
    reason: String,
}

#[async_trait]
impl LlmResponder for Unavailable {
    async fn respond(&self, _path: &[Message], _options: &CompletionOptions) -> LlmResult<LlmReply> {
        Err(LlmError::Configuration {
            message: self.reason.clone(),
        })
    }
}
