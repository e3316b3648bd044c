//! Conversation store implementations for stockchat.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use stockchat_core::error::StoreError;
use stockchat_core::store::ConversationStore;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Open the store named by `url`:
/// `memory` keeps everything in process, `sqlite:` opens a SQLite file (or
/// `sqlite::memory:`), `postgres://` / `postgresql://` connects to PostgreSQL.
pub async fn connect(url: &str, max_connections: u32) -> Result<Arc<dyn ConversationStore>, StoreError> {
    if url == "memory" {
        return Ok(Arc::new(InMemoryStore::new()));
    }

    #[cfg(feature = "sqlite")]
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteStore::new(url, max_connections).await?));
    }

    #[cfg(feature = "postgres")]
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(Arc::new(PostgresStore::connect(url, max_connections).await?));
    }

    let _ = max_connections;
    Err(StoreError::Connection(format!(
        "unsupported database URL '{url}' (enabled backends: {})",
        enabled_backends().join(", ")
    )))
}

fn enabled_backends() -> Vec<&'static str> {
    let mut backends = vec!["memory"];
    if cfg!(feature = "sqlite") {
        backends.push("sqlite");
    }
    if cfg!(feature = "postgres") {
        backends.push("postgres");
    }
    backends
}

/// Escape `LIKE` wildcards so the keyword matches literally (escape char `\`).
#[cfg_attr(not(any(feature = "sqlite", feature = "postgres")), allow(dead_code))]
pub(crate) fn escape_like(keyword: &str) -> String {
    keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn map_write_error(e: sqlx::Error, conversation_id: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::NotFound(conversation_id.to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Query(format!("conversation {conversation_id} already exists"))
        }
        _ => StoreError::Query(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_like_wildcards() {
        assert_eq!(escape_like("100%_a\\b"), "100\\%\\_a\\\\b");
    }

    #[tokio::test]
    async fn connect_memory() {
        let store = connect("memory", 1).await.unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test]
    async fn connect_sqlite_memory() {
        let store = connect("sqlite::memory:", 2).await.unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_url_is_rejected() {
        let err = connect("mysql://localhost/db", 1).await.err().unwrap();
        assert!(err.to_string().contains("unsupported database URL"));
    }
}
