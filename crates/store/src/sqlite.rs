//! SQLite conversation store.
//!
//! Uses a single SQLite database file with two tables:
//! - `conversations`: one row per chat session
//! - `messages`: the session's persisted turns, cascading on delete
//!
//! Timestamps are stored as RFC 3339 text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use stockchat_core::error::StoreError;
use stockchat_core::store::*;
use tracing::{debug, info};

use crate::{escape_like, map_write_error};

const SELECT_CONVERSATION: &str = r#"
    SELECT c.id, c.title, c.summary, c.metadata, c.created_at, c.updated_at,
           (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
    FROM conversations c
"#;

/// A SQLite-backed [`ConversationStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run migrations.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral in-process database
    /// (useful for tests).
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Connection(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections.max(1));
        if in_memory {
            // The database lives only as long as a connection does.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite conversation store initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create tables and indexes if they are missing.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id          TEXT PRIMARY KEY NOT NULL,
                title       TEXT NOT NULL,
                summary     TEXT,
                metadata    TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role            TEXT NOT NULL,
                content         TEXT,
                message_type    TEXT NOT NULL DEFAULT 'message',
                metadata        TEXT,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_created_at ON conversations(created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("created_at index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("messages index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    async fn fetch_page(
        &self,
        keyword: Option<&str>,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let rows = match keyword {
            Some(keyword) => {
                sqlx::query(&format!(
                    "{SELECT_CONVERSATION} WHERE c.title LIKE ?1 ESCAPE '\\' \
                     ORDER BY c.created_at DESC, c.rowid DESC LIMIT ?2 OFFSET ?3"
                ))
                .bind(format!("%{}%", escape_like(keyword)))
                .bind(i64::from(limit))
                .bind(i64::from(skip))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_CONVERSATION} ORDER BY c.created_at DESC, c.rowid DESC LIMIT ?1 OFFSET ?2"
                ))
                .bind(i64::from(limit))
                .bind(i64::from(skip))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(row_to_conversation).collect()
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("bad timestamp '{raw}': {e}")))
}

fn parse_metadata(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_conversation(row: &SqliteRow) -> Result<ConversationRecord, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Query(e.to_string());
    let created_at: String = row.try_get("created_at").map_err(get_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(get_err)?;
    let message_count: i64 = row.try_get("message_count").map_err(get_err)?;

    Ok(ConversationRecord {
        id: row.try_get("id").map_err(get_err)?,
        title: row.try_get("title").map_err(get_err)?,
        summary: row.try_get("summary").map_err(get_err)?,
        metadata: parse_metadata(row.try_get("metadata").map_err(get_err)?),
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        message_count: message_count.max(0) as u64,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Query(e.to_string());
    let created_at: String = row.try_get("created_at").map_err(get_err)?;

    Ok(StoredMessage {
        id: row.try_get("id").map_err(get_err)?,
        conversation_id: row.try_get("conversation_id").map_err(get_err)?,
        role: row.try_get("role").map_err(get_err)?,
        content: row.try_get("content").map_err(get_err)?,
        message_type: row.try_get("message_type").map_err(get_err)?,
        metadata: parse_metadata(row.try_get("metadata").map_err(get_err)?),
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_conversation(
        &self,
        id: &str,
        title: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<ConversationRecord, StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (id, title, summary, metadata, created_at, updated_at) \
             VALUES (?1, ?2, NULL, ?3, ?4, ?4)",
        )
        .bind(id)
        .bind(title)
        .bind(metadata.as_ref().map(|m| m.to_string()))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, id))?;

        debug!(conversation_id = id, "Conversation created");
        Ok(ConversationRecord {
            id: id.to_string(),
            title: title.to_string(),
            summary: None,
            metadata,
            created_at: now,
            updated_at: now,
            message_count: 0,
        })
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_CONVERSATION} WHERE c.id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn recent_conversations(&self, skip: u32, limit: u32) -> Result<Vec<ConversationRecord>, StoreError> {
        self.fetch_page(None, skip, limit).await
    }

    async fn search_conversations(
        &self,
        keyword: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        self.fetch_page(Some(keyword), skip, limit).await
    }

    async fn count_conversations(&self, keyword: Option<&str>) -> Result<u64, StoreError> {
        let count: i64 = match keyword {
            Some(keyword) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE title LIKE ?1 ESCAPE '\\'")
                    .bind(format!("%{}%", escape_like(keyword)))
                    .fetch_one(&self.pool)
                    .await
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let result = sqlx::query(
            "UPDATE conversations SET title = COALESCE(?2, title), \
             summary = COALESCE(?3, summary), updated_at = ?4 WHERE id = ?1",
        )
        .bind(id)
        .bind(update.title)
        .bind(update.summary)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_conversation(id).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, message_type, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.conversation_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(message.metadata.as_ref().map(|m| m.to_string()))
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, &message.conversation_id))?;

        sqlx::query("UPDATE conversations SET updated_at = ?2 WHERE id = ?1")
            .bind(&message.conversation_id)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(StoredMessage {
            id: result.last_insert_rowid(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            message_type: message.message_type,
            metadata: message.metadata,
            created_at: now,
        })
    }

    async fn messages(&self, conversation_id: &str, skip: u32, limit: u32) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, message_type, metadata, created_at \
             FROM messages WHERE conversation_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        )
        .bind(conversation_id)
        .bind(i64::from(limit))
        .bind(i64::from(skip))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn count_messages(&self, conversation_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| true)
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}
