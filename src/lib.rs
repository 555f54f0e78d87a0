//! # Branching Chat
//!
//! A conversation engine for LLM chats in which any message can become the
//! parent of a new message. A chat is a tree of alternative continuations:
//! regenerating a reply or editing an earlier turn adds a sibling branch
//! instead of overwriting history.
//!
//! ## Features
//!
//! - **Conversation tree**: O(1) node lookup, root-first path extraction for
//!   model context, append-only growth
//! - **Reconstruction**: rebuild a tree from flat parent-referencing rows with
//!   strict structural validation
//! - **Access control**: one owner per tree, disabled users rejected first
//! - **Orchestration**: send a message under any node and persist the reply
//!   with its usage metadata
//!
//! ## Architecture
//!
//! ```text
//! CLI → ChatService → ConversationTree (in memory, per request)
//!            ↓                 ↓
//!      OpenRouter (HTTP)   SQLite (flat message rows)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use branching_chat::{ChatService, Config, OpenRouterClient, SqliteStorage, User};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let client = OpenRouterClient::new(&config.llm, config.request.clone())?;
//!     let service = ChatService::new(storage, client, config.chat.clone());
//!
//!     let alice = User::new("alice", "alice@example.com");
//!     let mut tree = service.start_chat(&alice, None).await?;
//!     let options = service.default_send_options();
//!     let reply = service.send_message(&alice, &mut tree, None, "Hi", &options).await?;
//!     println!("{}", reply.content());
//!     Ok(())
//! }
//! ```

/// Ownership and activity checks on conversation trees.
pub mod access;
/// Chat use cases composing tree, storage and language model.
pub mod chat;
/// Command-line interface.
pub mod cli;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Language-model responder and the OpenRouter client.
pub mod llm;
/// SQLite storage layer for persistence.
pub mod storage;
/// Branching conversation tree and its reconstruction.
pub mod tree;

pub use access::{AccessVerifier, User};
pub use chat::{ChatService, Exchange, SendOptions};
pub use config::Config;
pub use error::{AppError, AppResult, ErrorKind};
pub use llm::{LlmResponder, OpenRouterClient};
pub use storage::{ChatRepository, SqliteStorage, TreeMetadata, UserRepository};
pub use tree::{ConversationTree, FlatMessageRecord, Message, NodeRef, Role, TreeView};
