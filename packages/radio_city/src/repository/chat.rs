use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::warn;

use crate::models::ChatMessage;

use super::ChatRepository;

impl ChatRepository {
    pub async fn insert_chat_message(&self, msg: &ChatMessage) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO chat_messages (uuid, nickname, content, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&msg.uuid)
        .bind(&msg.nickname)
        .bind(&msg.text)
        .bind(msg.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert chat message")?;

        Ok(result.last_insert_rowid())
    }

    /// The newest `limit` messages at or after `since`, oldest first.
    pub async fn chat_messages_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, nickname, content, created_at
            FROM chat_messages
            WHERE created_at >= ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(since.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load chat messages")?;

        let mut messages: Vec<ChatMessage> = rows
            .into_iter()
            .filter_map(|r| {
                let millis: i64 = r.get("created_at");
                let uuid: String = r.get("uuid");
                let Some(timestamp) = DateTime::from_timestamp_millis(millis) else {
                    warn!(%uuid, millis, "Skipping chat message with invalid timestamp");
                    return None;
                };
                Some(ChatMessage {
                    uuid,
                    nickname: r.get("nickname"),
                    text: r.get("content"),
                    timestamp,
                })
            })
            .collect();

        // Reverse so oldest is first (natural reading order)
        messages.reverse();

        Ok(messages)
    }
}
