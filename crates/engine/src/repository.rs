//! Persistence seams used by the dispatch engine.
//!
//! Postgres adapters back the running service; the in-memory adapters back tests
//! and single-process tooling. Attempts are append-only in both.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use sqlx::types::Json;
use thiserror::Error;
use uuid::Uuid;

use courier_common::types::{
    Channel, DeliveryAttempt, DeliveryError, DeliveryStatus, Message, MessageContent,
    MessageStatus, MessageType, NotificationPreferences, Recipient,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record {0} already exists")]
    Conflict(Uuid),

    #[error("record {0} not found")]
    NotFound(Uuid),
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: &Message) -> Result<(), RepositoryError>;
    async fn update(&self, message: &Message) -> Result<(), RepositoryError>;
    async fn get(&self, id: Uuid) -> Result<Option<Message>, RepositoryError>;
    /// Newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Message>, RepositoryError>;
}

#[async_trait]
pub trait AttemptRepository: Send + Sync {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<(), RepositoryError>;
    /// All attempts for a message, oldest first.
    async fn list_for_message(&self, message_id: Uuid) -> Result<Vec<DeliveryAttempt>, RepositoryError>;
}

#[async_trait]
pub trait PreferenceService: Send + Sync {
    /// `None` when the user has never stored preferences.
    async fn get_user_preferences(
        &self,
        user_id: Uuid,
    ) -> Result<Option<NotificationPreferences>, RepositoryError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    kind: MessageType,
    content: Json<MessageContent>,
    recipients: Json<Vec<Recipient>>,
    status: MessageStatus,
    metadata: Json<serde_json::Map<String, serde_json::Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            kind: row.kind,
            content: row.content.0,
            recipients: row.recipients.0,
            status: row.status,
            metadata: row.metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    message_id: Uuid,
    user_id: Uuid,
    channel: Channel,
    status: DeliveryStatus,
    attempted_at: DateTime<Utc>,
    error: Option<Json<DeliveryError>>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    provider_message_id: Option<String>,
    latency_ms: Option<i64>,
}

impl From<AttemptRow> for DeliveryAttempt {
    fn from(row: AttemptRow) -> Self {
        DeliveryAttempt {
            id: row.id,
            message_id: row.message_id,
            user_id: row.user_id,
            channel: row.channel,
            status: row.status,
            attempted_at: row.attempted_at,
            error: row.error.map(|e| e.0),
            retry_count: row.retry_count.max(0) as u32,
            next_retry_at: row.next_retry_at,
            provider_message_id: row.provider_message_id,
            latency_ms: row.latency_ms.map(|ms| ms.max(0) as u64),
        }
    }
}

/// Messages and attempts stored in Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store or replace a user's preferences.
    pub async fn upsert_preferences(
        &self,
        preferences: &NotificationPreferences,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO notification_preferences (user_id, settings, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE SET settings = EXCLUDED.settings, updated_at = NOW()
            "#,
        )
        .bind(preferences.user_id)
        .bind(Json(preferences))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for PgStore {
    async fn create(&self, message: &Message) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, kind, content, recipients, status, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.kind)
        .bind(Json(&message.content))
        .bind(Json(&message.recipients))
        .bind(message.status)
        .bind(Json(&message.metadata))
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(message.id));
        }
        Ok(())
    }

    async fn update(&self, message: &Message) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = $2, metadata = $3, recipients = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(message.id)
        .bind(message.status)
        .bind(Json(&message.metadata))
        .bind(Json(&message.recipients))
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(message.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, RepositoryError> {
        let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Message::from))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Message>, RepositoryError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM messages ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }
}

#[async_trait]
impl AttemptRepository for PgStore {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts
                (id, message_id, user_id, channel, status, attempted_at, error,
                 retry_count, next_retry_at, provider_message_id, latency_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.message_id)
        .bind(attempt.user_id)
        .bind(attempt.channel)
        .bind(attempt.status)
        .bind(attempt.attempted_at)
        .bind(attempt.error.as_ref().map(Json))
        .bind(attempt.retry_count as i32)
        .bind(attempt.next_retry_at)
        .bind(attempt.provider_message_id.as_deref())
        .bind(attempt.latency_ms.map(|ms| ms as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_message(&self, message_id: Uuid) -> Result<Vec<DeliveryAttempt>, RepositoryError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT * FROM delivery_attempts WHERE message_id = $1 ORDER BY attempted_at ASC, retry_count ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DeliveryAttempt::from).collect())
    }
}

#[async_trait]
impl PreferenceService for PgStore {
    async fn get_user_preferences(
        &self,
        user_id: Uuid,
    ) -> Result<Option<NotificationPreferences>, RepositoryError> {
        let row: Option<(Json<NotificationPreferences>,)> =
            sqlx::query_as("SELECT settings FROM notification_preferences WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(settings,)| settings.0))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<Uuid, Message>>,
    attempts: RwLock<Vec<DeliveryAttempt>>,
    preferences: RwLock<HashMap<Uuid, NotificationPreferences>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_preferences(&self, preferences: NotificationPreferences) {
        self.preferences
            .write()
            .insert(preferences.user_id, preferences);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.read().len()
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, message: &Message) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write();
        if messages.contains_key(&message.id) {
            return Err(RepositoryError::Conflict(message.id));
        }
        messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn update(&self, message: &Message) -> Result<(), RepositoryError> {
        match self.messages.write().get_mut(&message.id) {
            Some(stored) => {
                *stored = message.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(message.id)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, RepositoryError> {
        Ok(self.messages.read().get(&id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Message>, RepositoryError> {
        let mut messages: Vec<Message> = self.messages.read().values().cloned().collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(messages
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl AttemptRepository for MemoryStore {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<(), RepositoryError> {
        self.attempts.write().push(attempt.clone());
        Ok(())
    }

    async fn list_for_message(&self, message_id: Uuid) -> Result<Vec<DeliveryAttempt>, RepositoryError> {
        let mut attempts: Vec<DeliveryAttempt> = self
            .attempts
            .read()
            .iter()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| {
            a.attempted_at
                .cmp(&b.attempted_at)
                .then(a.retry_count.cmp(&b.retry_count))
        });
        Ok(attempts)
    }
}

#[async_trait]
impl PreferenceService for MemoryStore {
    async fn get_user_preferences(
        &self,
        user_id: Uuid,
    ) -> Result<Option<NotificationPreferences>, RepositoryError> {
        Ok(self.preferences.read().get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message() -> Message {
        let mut message = Message::new(
            MessageType::Invitation,
            MessageContent {
                subject: "Join us".into(),
                plain_text: "You are invited".into(),
                ..Default::default()
            },
            vec![Recipient::new(Uuid::new_v4())],
        );
        message.id = Uuid::new_v4();
        message
    }

    #[tokio::test]
    async fn test_memory_message_roundtrip() {
        let store = MemoryStore::new();
        let mut message = make_message();

        MessageRepository::create(&store, &message).await.unwrap();
        assert!(matches!(
            MessageRepository::create(&store, &message).await,
            Err(RepositoryError::Conflict(_))
        ));

        message.status = MessageStatus::Completed;
        store.update(&message).await.unwrap();
        let loaded = store.get(message.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MessageStatus::Completed);
        assert_eq!(store.list(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_update_unknown_message() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update(&make_message()).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_preferences_missing_is_none() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        assert!(store.get_user_preferences(user_id).await.unwrap().is_none());

        store.insert_preferences(NotificationPreferences::restrictive(user_id));
        assert!(store.get_user_preferences(user_id).await.unwrap().is_some());
    }
}
