use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted / wire shape of one message.
///
/// The tree structure is expressed only through `parent_id`; `None` marks the
/// root. `role` stays a raw string so that unknown values surface during
/// reconstruction instead of at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatMessageRecord {
    pub id: String,
    pub role: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub tree_id: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlatMessageRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
