//! Message submission, scheduling, status and retry routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Message, MessageContent, MessageType, Recipient};
use courier_engine::dispatch::{MessageStatusReport, RetryReport};

use crate::middleware::auth::Caller;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/messages", post(send_message).get(list_messages))
        .route("/api/messages/schedule", post(schedule_message))
        .route("/api/messages/{id}", get(get_message_status))
        .route("/api/messages/{id}/retry", post(retry_message))
}

/// Request body for a new message.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub kind: MessageType,
    pub content: MessageContent,
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SendMessageRequest {
    fn into_message(self, caller: &Caller) -> Message {
        let mut message = Message::new(self.kind, self.content, self.recipients);
        message.metadata = self.metadata;
        if let Some(client_id) = caller.client_id() {
            message
                .metadata
                .insert("submitted_by".to_string(), json!(client_id));
        }
        message
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleMessageRequest {
    #[serde(flatten)]
    pub message: SendMessageRequest,
    pub deliver_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// POST /api/messages - Validate, persist and deliver a message.
async fn send_message(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    let message = state.dispatcher.send(req.into_message(&caller)).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/messages/schedule - Store a message for later delivery.
async fn schedule_message(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<ScheduleMessageRequest>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    if req.deliver_at <= Utc::now() {
        return Err(AppError::Validation(
            "deliver_at must be in the future".to_string(),
        ));
    }
    let message = state
        .dispatcher
        .schedule(req.message.into_message(&caller), req.deliver_at)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(message)))
}

/// GET /api/messages - Stored messages, newest first.
async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Message>>, AppError> {
    if !(1..=500).contains(&params.limit) || params.offset < 0 {
        return Err(AppError::Validation(
            "limit must be between 1 and 500 and offset non-negative".to_string(),
        ));
    }
    let messages = state
        .dispatcher
        .list_messages(params.limit, params.offset)
        .await?;
    Ok(Json(messages))
}

/// GET /api/messages/:id - Message, attempt history and delivery summary.
async fn get_message_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageStatusReport>, AppError> {
    let report = state.dispatcher.get_status(id).await?;
    Ok(Json(report))
}

/// POST /api/messages/:id/retry - Re-attempt retryable failures.
async fn retry_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RetryReport>, AppError> {
    let report = state.dispatcher.retry_failed(id).await?;
    Ok(Json(report))
}
