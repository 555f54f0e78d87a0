//! Conversation orchestration.
//!
//! [`ChatService`] composes the tree, the access policy, a [`ChatRepository`]
//! and an [`LlmResponder`] into the two use cases a client needs: start a
//! chat, and send a message under any existing node and get a reply.
//!
//! Every call works on its own tree instance, either freshly started or
//! reconstructed from storage. The only cross-request state is a lock per tree
//! id that serializes [`ChatService::send_to_chat`] calls against one tree.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::access::{AccessVerifier, User};
use crate::config::ChatConfig;
use crate::error::{AppError, AppResult, TreeError};
use crate::llm::{CompletionOptions, LlmResponder};
use crate::storage::{AssistantDetail, ChatRepository, TreeMetadata};
use crate::tree::{ConversationTree, Message, TreeView};

/// Model parameters for one send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl SendOptions {
    /// Options carrying the configured chat defaults
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
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

impl From<&SendOptions> for CompletionOptions {
    fn from(options: &SendOptions) -> Self {
        Self {
            model: options.model.clone(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }
}

/// The user message and the reply it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub user_message: Message,
    pub assistant_message: Message,
}

/// Chat use cases over a repository and a language model.
pub struct ChatService<R, L> {
    repository: R,
    responder: L,
    config: ChatConfig,
    verifier: AccessVerifier,
    tree_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<R, L> ChatService<R, L>
where
    R: ChatRepository,
    L: LlmResponder,
{
    /// Create a new chat service
    pub fn new(repository: R, responder: L, config: ChatConfig) -> Self {
        Self {
            repository,
            responder,
            config,
            verifier: AccessVerifier::new(),
            tree_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Get a reference to the repository.
    #[inline]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Send options built from this service's chat defaults.
    pub fn default_send_options(&self) -> SendOptions {
        SendOptions::from_config(&self.config)
    }

    /// Start a new chat owned by `actor`.
    ///
    /// The root is a system message holding `system_prompt`, or the configured
    /// default prompt when none (or an empty one) is given.
    pub async fn start_chat(
        &self,
        actor: &User,
        system_prompt: Option<&str>,
    ) -> AppResult<ConversationTree> {
        self.verifier.ensure_active(actor)?;

        let prompt = system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&self.config.system_prompt);

        let metadata = TreeMetadata::new(&actor.id);
        let root = Message::system(prompt);

        let mut tree = ConversationTree::new();
        tree.start_new_tree(root.clone(), &actor.id, &metadata.id)?;

        self.repository.create_tree(&metadata).await?;
        self.repository
            .save_message(&root, None, &metadata.id, &actor.id)
            .await?;

        info!(
            tree_id = %metadata.id,
            user_id = %actor.id,
            message_id = %root.id(),
            "Chat started"
        );

        Ok(tree)
    }

    /// Load a chat for `actor`.
    ///
    /// Ownership is checked against the stored tree metadata before any
    /// message is read; the rebuilt tree takes its id and owner from that
    /// metadata, never from the message rows.
    pub async fn resume_chat(&self, actor: &User, tree_id: &str) -> AppResult<ConversationTree> {
        self.verifier.ensure_active(actor)?;

        let metadata = self
            .repository
            .get_tree_metadata(tree_id)
            .await?
            .ok_or_else(|| AppError::TreeNotFound {
                tree_id: tree_id.to_string(),
            })?;

        let mut ownership = ConversationTree::new();
        ownership.stamp_identity(&metadata.id, &metadata.owner_id)?;
        self.verifier.verify(actor, &ownership)?;

        let records = self.repository.get_flat_records(tree_id, actor).await?;
        let mut tree = ConversationTree::restore_from_records(&records).map_err(|e| {
            warn!(tree_id = %tree_id, error = %e, "Stored chat tree is corrupt");
            e
        })?;
        tree.stamp_identity(metadata.id, metadata.owner_id)?;

        debug!(tree_id = %tree_id, messages = tree.len(), "Chat resumed");
        Ok(tree)
    }

    /// Send `content` under `parent_id` and return the assistant's reply.
    ///
    /// With no `parent_id`, the root is used while it has no children yet.
    /// Nothing is persisted and the model is not called when the actor, the
    /// content or the attach point is rejected. Each message joins `tree` only
    /// after it is saved. If the model call fails, the user message stays
    /// persisted and the error is returned.
    pub async fn send_message(
        &self,
        actor: &User,
        tree: &mut ConversationTree,
        parent_id: Option<&str>,
        content: &str,
        options: &SendOptions,
    ) -> AppResult<Message> {
        let start = Instant::now();

        // 1. ownership
        self.verifier.verify(actor, tree)?;
        let (tree_id, owner_id) = match (tree.id(), tree.owner_id()) {
            (Some(id), Some(owner)) => (id.to_string(), owner.to_string()),
            _ => {
                return Err(TreeError::InvalidOperation {
                    message: "tree has no identity".to_string(),
                }
                .into())
            }
        };

        if content.trim().is_empty() {
            return Err(TreeError::InvalidOperation {
                message: "message content cannot be empty".to_string(),
            }
            .into());
        }

        // 2. attachability
        let parent_id = match parent_id {
            Some(id) => id.to_string(),
            None => tree
                .default_attach_point()
                .map(str::to_string)
                .ok_or_else(|| TreeError::InvalidOperation {
                    message: "a parent message id is required once the chat has replies"
                        .to_string(),
                })?,
        };
        if !tree.can_attach_to(&parent_id) {
            return Err(TreeError::InvalidOperation {
                message: format!("cannot attach to message {}", parent_id),
            }
            .into());
        }

        // 3. user message
        let user_message = Message::user(content);
        self.repository
            .save_message(&user_message, Some(&parent_id), &tree_id, &owner_id)
            .await?;
        tree.append_message(&parent_id, user_message.clone())?;

        debug!(
            tree_id = %tree_id,
            message_id = %user_message.id(),
            parent_id = %parent_id,
            "User message saved"
        );

        // 4-5. model call on the path ending with the new message
        let path = tree.get_path_to_root(user_message.id())?;
        let completion = CompletionOptions::from(options);
        let reply = match self.responder.respond(&path, &completion).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    tree_id = %tree_id,
                    message_id = %user_message.id(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Language model call failed, chat awaits a reply"
                );
                return Err(e.into());
            }
        };

        // 6. assistant message and its detail
        let detail = AssistantDetail::from_reply(&reply, &completion);
        let assistant_message = Message::assistant(reply.content);
        self.repository
            .save_assistant_reply(
                &assistant_message,
                user_message.id(),
                &tree_id,
                &owner_id,
                &detail,
            )
            .await?;
        tree.append_message(user_message.id(), assistant_message.clone())?;

        info!(
            tree_id = %tree_id,
            user_id = %actor.id,
            message_id = %assistant_message.id(),
            total_tokens = detail.total_tokens,
            latency_ms = start.elapsed().as_millis() as u64,
            "Assistant reply saved"
        );

        // 7.
        Ok(assistant_message)
    }

    /// Resume `tree_id` and send one message, serialized with any other
    /// `send_to_chat` on the same tree in this process.
    pub async fn send_to_chat(
        &self,
        actor: &User,
        tree_id: &str,
        parent_id: Option<&str>,
        content: &str,
        options: &SendOptions,
    ) -> AppResult<Exchange> {
        let lock = self.tree_lock(tree_id);
        let result = {
            let _guard = lock.lock().await;
            self.send_locked(actor, tree_id, parent_id, content, options)
                .await
        };
        drop(lock);
        self.release_tree_lock(tree_id);
        result
    }

    async fn send_locked(
        &self,
        actor: &User,
        tree_id: &str,
        parent_id: Option<&str>,
        content: &str,
        options: &SendOptions,
    ) -> AppResult<Exchange> {
        let mut tree = self.resume_chat(actor, tree_id).await?;
        let assistant_message = self
            .send_message(actor, &mut tree, parent_id, content, options)
            .await?;

        let user_message = tree
            .find_node(assistant_message.id())?
            .parent()
            .map(|node| node.message().clone())
            .ok_or_else(|| AppError::Internal {
                message: "assistant reply has no parent".to_string(),
            })?;

        Ok(Exchange {
            user_message,
            assistant_message,
        })
    }

    /// Every chat `actor` owns, most recently updated first.
    pub async fn list_chats(&self, actor: &User) -> AppResult<Vec<TreeMetadata>> {
        self.verifier.ensure_active(actor)?;
        Ok(self.repository.list_trees_for_owner(actor).await?)
    }

    /// Nested view of a chat for display.
    pub async fn chat_view(&self, actor: &User, tree_id: &str) -> AppResult<TreeView> {
        let tree = self.resume_chat(actor, tree_id).await?;
        tree.to_view().ok_or_else(|| AppError::TreeNotFound {
            tree_id: tree_id.to_string(),
        })
    }

    fn tree_lock(&self, tree_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .tree_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(tree_id.to_string()).or_default().clone()
    }

    fn release_tree_lock(&self, tree_id: &str) {
        let mut locks = self
            .tree_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(tree_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(tree_id);
        }
    }
}
