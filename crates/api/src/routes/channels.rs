//! Delivery channel discovery.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use courier_common::types::Channel;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/channels", get(list_channels))
}

#[derive(Debug, Serialize)]
pub struct ChannelInfo {
    pub channel: Channel,
    pub available: bool,
}

/// GET /api/channels - Every channel and whether a provider can deliver on it right now.
async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelInfo>> {
    let available = state.dispatcher.available_channels();
    Json(
        Channel::ALL
            .iter()
            .map(|channel| ChannelInfo {
                channel: *channel,
                available: available.contains(channel),
            })
            .collect(),
    )
}
