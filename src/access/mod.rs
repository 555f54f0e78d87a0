//! Access verification for conversation trees.
//!
//! A tree belongs to exactly one user. Disabled users are rejected before
//! ownership is even looked at, so they learn nothing about which chats exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::AccessError;
use crate::tree::ConversationTree;

/// An authenticated actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user identifier.
    pub id: String,
    /// Login name, unique.
    pub username: String,
    /// Contact address, unique.
    pub email: String,
    /// Disabled users can no longer read or write any chat.
    pub is_active: bool,
    /// When the user was provisioned.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a new active user with a fresh id
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            email: email.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Mark the user as disabled
    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Ownership and activity policy check.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessVerifier;

impl AccessVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Succeeds only for an active user who owns `tree`. No side effects.
    pub fn verify(&self, actor: &User, tree: &ConversationTree) -> Result<(), AccessError> {
        self.ensure_active(actor)?;

        if !tree.is_owned_by(&actor.id) {
            warn!(user_id = %actor.id, "Access to chat tree denied");
            return Err(AccessError::AccessDenied {
                user_id: actor.id.clone(),
            });
        }

        Ok(())
    }

    /// The inactive-actor half of [`verify`](Self::verify), for operations
    /// that do not target an existing tree (starting or listing chats).
    pub fn ensure_active(&self, actor: &User) -> Result<(), AccessError> {
        if !actor.is_active {
            warn!(user_id = %actor.id, "Inactive user rejected");
            return Err(AccessError::InactiveActor {
                user_id: actor.id.clone(),
            });
        }
        Ok(())
    }
}
