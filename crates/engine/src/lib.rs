//! Delivery core: failure classification, rate limiting, telemetry and dispatch.

pub mod classifier;
pub mod dispatch;
pub mod ratelimit;
pub mod repository;
pub mod telemetry;
pub mod validation;

pub use classifier::{Classification, ErrorCategory};
pub use dispatch::{DispatchConfig, DispatchError, Dispatcher};
pub use ratelimit::{RateLimiter, RateLimitError};
pub use telemetry::Telemetry;
