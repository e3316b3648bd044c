//! PostgreSQL conversation store.
//!
//! Same schema as the SQLite store with native types: `TIMESTAMPTZ`
//! timestamps, `JSONB` metadata and a `BIGSERIAL` message id.
//!
//! # Feature gate
//!
//! This module is behind the `postgres` feature flag:
//!
//! ```toml
//! stockchat-store = { workspace = true, features = ["postgres"] }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use stockchat_core::error::StoreError;
use stockchat_core::store::*;
use tracing::{debug, info};

use crate::{escape_like, map_write_error};

const SELECT_CONVERSATION: &str = r#"
    SELECT c.id, c.title, c.summary, c.metadata, c.created_at, c.updated_at,
           (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
    FROM conversations c
"#;

/// A PostgreSQL-backed [`ConversationStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(format!("PostgreSQL connection failed: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("Connected to PostgreSQL conversation store");
        Ok(store)
    }

    /// Create from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id          VARCHAR(50) PRIMARY KEY,
                title       VARCHAR(200) NOT NULL,
                summary     TEXT,
                metadata    JSONB,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id              BIGSERIAL PRIMARY KEY,
                conversation_id VARCHAR(50) NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role            VARCHAR(20) NOT NULL,
                content         TEXT,
                message_type    VARCHAR(32) NOT NULL DEFAULT 'message',
                metadata        JSONB,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
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

        debug!("PostgreSQL migrations complete");
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
                    "{SELECT_CONVERSATION} WHERE c.title ILIKE $1 ESCAPE '\\' \
                     ORDER BY c.created_at DESC, c.id DESC LIMIT $2 OFFSET $3"
                ))
                .bind(format!("%{}%", escape_like(keyword)))
                .bind(i64::from(limit))
                .bind(i64::from(skip))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_CONVERSATION} ORDER BY c.created_at DESC, c.id DESC LIMIT $1 OFFSET $2"
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

fn row_to_conversation(row: &PgRow) -> Result<ConversationRecord, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Query(e.to_string());
    let message_count: i64 = row.try_get("message_count").map_err(get_err)?;
    Ok(ConversationRecord {
        id: row.try_get("id").map_err(get_err)?,
        title: row.try_get("title").map_err(get_err)?,
        summary: row.try_get("summary").map_err(get_err)?,
        metadata: row.try_get("metadata").map_err(get_err)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(get_err)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(get_err)?,
        message_count: message_count.max(0) as u64,
    })
}

fn row_to_message(row: &PgRow) -> Result<StoredMessage, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Query(e.to_string());
    Ok(StoredMessage {
        id: row.try_get("id").map_err(get_err)?,
        conversation_id: row.try_get("conversation_id").map_err(get_err)?,
        role: row.try_get("role").map_err(get_err)?,
        content: row.try_get("content").map_err(get_err)?,
        message_type: row.try_get("message_type").map_err(get_err)?,
        metadata: row.try_get("metadata").map_err(get_err)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(get_err)?,
    })
}

#[async_trait]
impl ConversationStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
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
             VALUES ($1, $2, NULL, $3, $4, $4)",
        )
        .bind(id)
        .bind(title)
        .bind(&metadata)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, id))?;

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
        let row = sqlx::query(&format!("{SELECT_CONVERSATION} WHERE c.id = $1"))
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
                sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE title ILIKE $1 ESCAPE '\\'")
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
            "UPDATE conversations SET title = COALESCE($2, title), \
             summary = COALESCE($3, summary), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(update.title)
        .bind(update.summary)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_conversation(id).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
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

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (conversation_id, role, content, message_type, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&message.conversation_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(&message.metadata)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, &message.conversation_id))?;

        sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
            .bind(&message.conversation_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(StoredMessage {
            id,
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
             FROM messages WHERE conversation_id = $1 ORDER BY id ASC LIMIT $2 OFFSET $3",
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
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
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
