//! Storage layer for chat persistence.
//!
//! This module provides SQLite-based storage for users, chat tree metadata,
//! flat message rows and assistant message details. Trees are never stored
//! nested: each message is one row referencing its parent by id.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::User;
use crate::error::StorageResult;
use crate::llm::{CompletionOptions, LlmReply};
use crate::tree::{FlatMessageRecord, Message};

/// Authoritative metadata of one chat tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    /// Unique tree identifier.
    pub id: String,
    /// The only user allowed to read or extend the tree.
    pub owner_id: String,
    /// When the tree was started.
    pub created_at: DateTime<Utc>,
    /// When the last message was added.
    pub updated_at: DateTime<Utc>,
}

impl TreeMetadata {
    /// Metadata for a brand new tree owned by `owner_id`
    pub fn new(owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// LLM metadata recorded for an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantDetail {
    /// Upstream provider that served the completion.
    pub provider: Option<String>,
    /// Model that produced the reply.
    pub model_name: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Temperature requested, if any.
    pub temperature: Option<f64>,
    /// Token limit requested, if any.
    pub max_tokens: Option<u32>,
    /// Why generation stopped (`stop`, `length`, ...).
    pub finish_reason: Option<String>,
    /// Provider-side generation id.
    pub gen_id: Option<String>,
}

impl AssistantDetail {
    /// Combine a reply's usage metadata with the options that produced it
    pub fn from_reply(reply: &LlmReply, options: &CompletionOptions) -> Self {
        Self {
            provider: reply.provider.clone(),
            model_name: reply
                .model_name
                .clone()
                .or_else(|| Some(options.model.clone())),
            prompt_tokens: reply.usage.prompt_tokens,
            completion_tokens: reply.usage.completion_tokens,
            total_tokens: reply.usage.total_tokens,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            finish_reason: reply.finish_reason.clone(),
            gen_id: reply.raw_response_id.clone(),
        }
    }
}

/// Persistence of chat trees as flat records.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Register a new tree and its owner.
    async fn create_tree(&self, metadata: &TreeMetadata) -> StorageResult<()>;

    /// Persist one message as a flat row. `parent_id` is `None` only for the root.
    async fn save_message(
        &self,
        message: &Message,
        parent_id: Option<&str>,
        tree_id: &str,
        owner_id: &str,
    ) -> StorageResult<()>;

    /// Persist an assistant reply and its detail together; neither is kept
    /// if either insert fails.
    async fn save_assistant_reply(
        &self,
        message: &Message,
        parent_id: &str,
        tree_id: &str,
        owner_id: &str,
        detail: &AssistantDetail,
    ) -> StorageResult<()>;

    /// Persist LLM usage metadata for an assistant message.
    async fn save_assistant_detail(
        &self,
        message_id: &str,
        detail: &AssistantDetail,
        owner_id: &str,
    ) -> StorageResult<()>;

    /// Fetch the detail saved for `message_id`, if any.
    async fn get_assistant_detail(&self, message_id: &str)
        -> StorageResult<Option<AssistantDetail>>;

    /// All rows of `tree_id` visible to `actor`; empty when none are.
    async fn get_flat_records(
        &self,
        tree_id: &str,
        actor: &User,
    ) -> StorageResult<Vec<FlatMessageRecord>>;

    async fn get_tree_metadata(&self, tree_id: &str) -> StorageResult<Option<TreeMetadata>>;

    async fn list_tree_ids_for_owner(&self, actor: &User) -> StorageResult<Vec<String>>;

    /// Metadata of every tree owned by `actor`, most recently updated first.
    async fn list_trees_for_owner(&self, actor: &User) -> StorageResult<Vec<TreeMetadata>>;
}

/// User provisioning.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user; duplicate usernames or emails are a conflict.
    async fn create_user(&self, user: &User) -> StorageResult<()>;

    async fn get_user(&self, id: &str) -> StorageResult<Option<User>>;

    async fn find_user_by_username(&self, username: &str) -> StorageResult<Option<User>>;

    /// Enable or disable a user.
    async fn set_user_active(&self, id: &str, is_active: bool) -> StorageResult<()>;

    async fn list_users(&self) -> StorageResult<Vec<User>>;
}
