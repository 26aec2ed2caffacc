use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};

use shared::domain::{MessageId, RoomId, UserId};

/// Persisted-message store backing the relay. Conversations themselves are
/// owned by the wider application; this store only records their messages
/// and last-activity markers.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn insert_message(
        &self,
        conversation_id: RoomId,
        sender_id: UserId,
        sender_name: &str,
        body: &str,
    ) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_user_id, sender_name, body, read_flag, created_at)
             VALUES (?, ?, ?, ?, 0, ?)
             RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(sender_name)
        .bind(body)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            conversation_id,
            sender_id,
            sender_name: sender_name.to_string(),
            body: body.to_string(),
            read: false,
            created_at,
        })
    }

    /// Most recent `limit` messages of a conversation, oldest first.
    pub async fn list_recent_messages(
        &self,
        conversation_id: RoomId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = sqlx::query(
            "SELECT id, conversation_id, sender_user_id, sender_name, body, read_flag, created_at
             FROM messages
             WHERE conversation_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(conversation_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_user_id, sender_name, body, read_flag, created_at
             FROM messages
             WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_message))
    }

    /// Flips the read flag on the given messages. Returns how many rows
    /// actually changed.
    pub async fn mark_messages_read(&self, message_ids: &[MessageId]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql =
            format!("UPDATE messages SET read_flag = 1 WHERE id IN ({placeholders}) AND read_flag = 0");
        let mut query = sqlx::query(&sql);
        for id in message_ids {
            query = query.bind(id.0);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn touch_last_activity(&self, conversation_id: RoomId) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (id, last_activity_at) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET last_activity_at = excluded.last_activity_at",
        )
        .bind(conversation_id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_activity(&self, conversation_id: RoomId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_activity_at FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
    }
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        conversation_id: RoomId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_name: r.get::<String, _>(3),
        body: r.get::<String, _>(4),
        read: r.get::<bool, _>(5),
        created_at: r.get::<DateTime<Utc>, _>(6),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory '{}' for database url '{database_url}'",
                    parent.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
