//! Delivery telemetry queries.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use courier_common::error::AppError;
use courier_common::types::{Channel, MessageMetrics};
use courier_engine::telemetry::{AttemptRecord, ChannelStats, ErrorRecord, LatencyStats};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/metrics", get(get_metrics))
        .route("/api/metrics/counters", get(get_counters))
        .route("/api/metrics/attempts", get(get_recent_attempts))
        .route("/api/metrics/channels/{channel}", get(get_channel_stats))
        .route("/api/metrics/channels/{channel}/errors", get(get_recent_errors))
        .route("/api/metrics/channels/{channel}/latency", get(get_latency_stats))
}

#[derive(Debug, Deserialize)]
pub struct WindowParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

/// GET /api/metrics - Aggregates over `[start, end]`, defaulting to the last 24 hours.
async fn get_metrics(
    State(state): State<AppState>,
    Query(params): Query<WindowParams>,
) -> Result<Json<MessageMetrics>, AppError> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::hours(24));
    if start > end {
        return Err(AppError::Validation("start must not be after end".to_string()));
    }
    Ok(Json(state.dispatcher.telemetry().get_metrics(start, end)))
}

/// GET /api/metrics/counters - Named counters and gauges.
async fn get_counters(State(state): State<AppState>) -> Json<serde_json::Value> {
    let telemetry = state.dispatcher.telemetry();
    Json(json!({
        "counters": telemetry.get_counters(),
        "gauges": telemetry.get_gauges(),
    }))
}

/// GET /api/metrics/attempts - Most recent attempts, newest last.
async fn get_recent_attempts(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<AttemptRecord>> {
    let limit = params.limit.unwrap_or(100);
    Json(state.dispatcher.telemetry().get_recent_attempts(limit))
}

/// GET /api/metrics/channels/:channel - Lifetime counters for one channel.
async fn get_channel_stats(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<ChannelStats>, AppError> {
    let channel: Channel = channel.parse()?;
    state
        .dispatcher
        .telemetry()
        .get_channel_stats(channel)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No activity recorded for channel {channel}")))
}

/// GET /api/metrics/channels/:channel/errors - Recent errors, newest last.
async fn get_recent_errors(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<ErrorRecord>>, AppError> {
    let channel: Channel = channel.parse()?;
    let limit = params.limit.unwrap_or(50);
    Ok(Json(
        state.dispatcher.telemetry().get_recent_errors(channel, limit),
    ))
}

/// GET /api/metrics/channels/:channel/latency - Latency percentiles.
async fn get_latency_stats(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<LatencyStats>, AppError> {
    let channel: Channel = channel.parse()?;
    state
        .dispatcher
        .telemetry()
        .get_latency_stats(channel)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No latency samples for channel {channel}")))
}
