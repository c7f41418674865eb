pub mod channels;
pub mod health;
pub mod messages;
pub mod metrics;

use axum::Router;
use axum::middleware::from_fn_with_state;

use crate::middleware::rate_limit::rate_limit;
use crate::state::AppState;

/// Build the complete API router with all routes.
///
/// `/health` sits outside the rate limiter.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(messages::router())
        .merge(channels::router())
        .merge(metrics::router())
        .route_layer(from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(health::router())
        .merge(api)
        .with_state(state)
}
