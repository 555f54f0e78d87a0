use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{AssistantDetail, ChatRepository, TreeMetadata, UserRepository};
use crate::access::User;
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::tree::{FlatMessageRecord, Message};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create a private in-memory database (one connection, never recycled)
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Map unique-constraint violations to [`StorageError::Conflict`].
fn conflict_or(err: sqlx::Error, message: impl FnOnce() -> String) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict {
            message: message(),
        },
        _ => StorageError::Sqlx(err),
    }
}

async fn insert_message(
    conn: &mut SqliteConnection,
    message: &Message,
    parent_id: Option<&str>,
    tree_id: &str,
    owner_id: &str,
) -> StorageResult<()> {
    let created_at = message.created_at().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO messages (id, tree_id, parent_id, role, content, owner_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message.id())
    .bind(tree_id)
    .bind(parent_id)
    .bind(message.role().as_str())
    .bind(message.content())
    .bind(owner_id)
    .bind(&created_at)
    .bind(&created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_or(e, || format!("message {} already exists", message.id())))?;
    Ok(())
}

async fn insert_detail(
    conn: &mut SqliteConnection,
    message_id: &str,
    detail: &AssistantDetail,
    owner_id: &str,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO assistant_message_details
            (message_id, owner_id, provider, model_name, prompt_tokens, completion_tokens,
             total_tokens, temperature, max_tokens, finish_reason, gen_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message_id)
    .bind(owner_id)
    .bind(&detail.provider)
    .bind(&detail.model_name)
    .bind(i64::from(detail.prompt_tokens))
    .bind(i64::from(detail.completion_tokens))
    .bind(i64::from(detail.total_tokens))
    .bind(detail.temperature)
    .bind(detail.max_tokens.map(i64::from))
    .bind(&detail.finish_reason)
    .bind(&detail.gen_id)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_or(e, || format!("detail for message {} already exists", message_id)))?;
    Ok(())
}

async fn touch_tree(conn: &mut SqliteConnection, tree_id: &str) -> StorageResult<()> {
    sqlx::query("UPDATE chat_trees SET updated_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(tree_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ChatRepository for SqliteStorage {
    async fn create_tree(&self, metadata: &TreeMetadata) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_trees (id, owner_id, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&metadata.id)
        .bind(&metadata.owner_id)
        .bind(metadata.created_at.to_rfc3339())
        .bind(metadata.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or(e, || format!("chat tree {} already exists", metadata.id)))?;

        debug!(tree_id = %metadata.id, owner_id = %metadata.owner_id, "Chat tree created");
        Ok(())
    }

    async fn save_message(
        &self,
        message: &Message,
        parent_id: Option<&str>,
        tree_id: &str,
        owner_id: &str,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_message(&mut tx, message, parent_id, tree_id, owner_id).await?;
        touch_tree(&mut tx, tree_id).await?;
        tx.commit().await?;

        debug!(
            tree_id = %tree_id,
            message_id = %message.id(),
            role = %message.role(),
            "Message saved"
        );
        Ok(())
    }

    async fn save_assistant_reply(
        &self,
        message: &Message,
        parent_id: &str,
        tree_id: &str,
        owner_id: &str,
        detail: &AssistantDetail,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_message(&mut tx, message, Some(parent_id), tree_id, owner_id).await?;
        insert_detail(&mut tx, message.id(), detail, owner_id).await?;
        touch_tree(&mut tx, tree_id).await?;
        tx.commit().await?;

        debug!(
            tree_id = %tree_id,
            message_id = %message.id(),
            total_tokens = detail.total_tokens,
            "Assistant reply saved with detail"
        );
        Ok(())
    }

    async fn save_assistant_detail(
        &self,
        message_id: &str,
        detail: &AssistantDetail,
        owner_id: &str,
    ) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_detail(&mut conn, message_id, detail, owner_id).await
    }

    async fn get_assistant_detail(
        &self,
        message_id: &str,
    ) -> StorageResult<Option<AssistantDetail>> {
        let row: Option<DetailRow> = sqlx::query_as(
            r#"
            SELECT provider, model_name, prompt_tokens, completion_tokens, total_tokens,
                   temperature, max_tokens, finish_reason, gen_id
            FROM assistant_message_details
            WHERE message_id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn get_flat_records(
        &self,
        tree_id: &str,
        actor: &User,
    ) -> StorageResult<Vec<FlatMessageRecord>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT m.id, m.role, m.content, m.parent_id, m.tree_id, m.owner_id, m.created_at, m.updated_at
            FROM messages m
            JOIN chat_trees t ON t.id = m.tree_id
            WHERE m.tree_id = ? AND t.owner_id = ?
            ORDER BY m.created_at ASC, m.rowid ASC
            "#,
        )
        .bind(tree_id)
        .bind(&actor.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn get_tree_metadata(&self, tree_id: &str) -> StorageResult<Option<TreeMetadata>> {
        let row: Option<TreeRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, created_at, updated_at
            FROM chat_trees
            WHERE id = ?
            "#,
        )
        .bind(tree_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_tree_ids_for_owner(&self, actor: &User) -> StorageResult<Vec<String>> {
        Ok(self
            .list_trees_for_owner(actor)
            .await?
            .into_iter()
            .map(|tree| tree.id)
            .collect())
    }

    async fn list_trees_for_owner(&self, actor: &User) -> StorageResult<Vec<TreeMetadata>> {
        let rows: Vec<TreeRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, created_at, updated_at
            FROM chat_trees
            WHERE owner_id = ?
            ORDER BY updated_at DESC, created_at DESC
            "#,
        )
        .bind(&actor.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

#[async_trait]
impl UserRepository for SqliteStorage {
    async fn create_user(&self, user: &User) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.is_active)
        .bind(user.created_at.to_rfc3339())
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_or(e, || {
                format!(
                    "username '{}' or email '{}' already exists",
                    user.username, user.email
                )
            })
        })?;

        info!(user_id = %user.id, username = %user.username, "User created");
        Ok(())
    }

    async fn get_user(&self, id: &str) -> StorageResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, username, email, is_active, created_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_user_by_username(&self, username: &str) -> StorageResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, username, email, is_active, created_at
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn set_user_active(&self, id: &str, is_active: bool) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(is_active)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::UserNotFound {
                user_id: id.to_string(),
            });
        }

        info!(user_id = %id, is_active, "User activity changed");
        Ok(())
    }

    async fn list_users(&self) -> StorageResult<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as(
            r#"
            SELECT id, username, email, is_active, created_at
            FROM users
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    parent_id: Option<String>,
    tree_id: String,
    owner_id: String,
    created_at: String,
    updated_at: String,
}

impl From<MessageRow> for FlatMessageRecord {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            role: row.role,
            content: row.content,
            parent_id: row.parent_id,
            tree_id: row.tree_id,
            owner_id: row.owner_id,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TreeRow {
    id: String,
    owner_id: String,
    created_at: String,
    updated_at: String,
}

impl From<TreeRow> for TreeMetadata {
    fn from(row: TreeRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DetailRow {
    provider: Option<String>,
    model_name: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    temperature: Option<f64>,
    max_tokens: Option<i64>,
    finish_reason: Option<String>,
    gen_id: Option<String>,
}

impl From<DetailRow> for AssistantDetail {
    fn from(row: DetailRow) -> Self {
        let tokens = |value: i64| u32::try_from(value).unwrap_or_default();
        Self {
            provider: row.provider,
            model_name: row.model_name,
            prompt_tokens: tokens(row.prompt_tokens),
            completion_tokens: tokens(row.completion_tokens),
            total_tokens: tokens(row.total_tokens),
            temperature: row.temperature,
            max_tokens: row.max_tokens.and_then(|v| u32::try_from(v).ok()),
            finish_reason: row.finish_reason,
            gen_id: row.gen_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    email: String,
    is_active: bool,
    created_at: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            email: row.email,
            is_active: row.is_active,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}
