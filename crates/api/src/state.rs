//! Shared application state for the Axum API server.

use courier_common::config::AppConfig;
use courier_engine::{Dispatcher, RateLimiter};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub rate_limiter: RateLimiter,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, rate_limiter: RateLimiter, config: AppConfig) -> Self {
        Self {
            dispatcher,
            rate_limiter,
            config,
        }
    }
}
