use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Chat tree not found: {tree_id}")]
    TreeNotFound { tree_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Conversation-tree errors: structural (reconstruction), lookup and misuse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("No root message found (no record without a parent)")]
    NoRoot,

    #[error("Multiple root messages found: {first} and {second}")]
    MultipleRoots { first: String, second: String },

    #[error("Parent {parent_id} not found for message {message_id}")]
    DanglingParent {
        message_id: String,
        parent_id: String,
    },

    #[error("Invalid role '{role}' on message {message_id}")]
    InvalidRole { message_id: String, role: String },

    #[error("Duplicate message id: {message_id}")]
    DuplicateMessage { message_id: String },

    #[error("Message {message_id} belongs to tree {tree_id}, expected {expected}")]
    ForeignRecord {
        message_id: String,
        tree_id: String,
        expected: String,
    },

    #[error("Message {message_id} is not reachable from the root")]
    Cycle { message_id: String },

    #[error("Message not found in tree: {message_id}")]
    NodeNotFound { message_id: String },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },
}

/// Authorization errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("User {user_id} does not have access to this chat")]
    AccessDenied { user_id: String },

    #[error("User {user_id} is inactive")]
    InactiveActor { user_id: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("User not found: {user_id}")]
    UserNotFound { user_id: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// LLM provider errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("LLM client misconfigured: {message}")]
    Configuration { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlmError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout { .. } | LlmError::Http(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::InvalidResponse { .. } | LlmError::Configuration { .. } => false,
        }
    }
}

/// Caller-facing classification of an [`AppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Persisted tree is structurally invalid.
    CorruptTree,
    /// Tree or message does not exist, or the caller may not see it.
    NotFound,
    /// The request misuses the tree (bad attach point, empty content, ...).
    InvalidOperation,
    /// The LLM call failed; retrying the same request may succeed.
    Transient,
    /// Storage, configuration or other internal failures.
    Internal,
}

impl AppError {
    /// Classify this error for callers.
    ///
    /// Access failures collapse into [`ErrorKind::NotFound`]: a chat owned by
    /// someone else looks exactly like one that does not exist.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Tree(TreeError::NodeNotFound { .. }) => ErrorKind::NotFound,
            AppError::Tree(TreeError::InvalidOperation { .. }) => ErrorKind::InvalidOperation,
            AppError::Tree(_) => ErrorKind::CorruptTree,
            AppError::Access(_) | AppError::TreeNotFound { .. } => ErrorKind::NotFound,
            AppError::Llm(LlmError::Configuration { .. }) => ErrorKind::Internal,
            AppError::Llm(_) => ErrorKind::Transient,
            AppError::Config { .. } | AppError::Storage(_) | AppError::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Message safe to show to an end user.
    ///
    /// Configuration problems keep their detail; they name settings, never
    /// chats or users.
    pub fn public_message(&self) -> String {
        if matches!(
            self,
            AppError::Config { .. } | AppError::Llm(LlmError::Configuration { .. })
        ) {
            return self.to_string();
        }
        match self.kind() {
            ErrorKind::NotFound => "Chat not found".to_string(),
            ErrorKind::CorruptTree => "Chat history is corrupt".to_string(),
            ErrorKind::InvalidOperation => self.to_string(),
            ErrorKind::Transient => "The language model did not respond, please retry".to_string(),
            ErrorKind::Internal => "Internal error".to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;
