//! Courier HTTP API: message submission, delivery status, channel and
//! telemetry queries, behind tiered request rate limiting.

pub mod middleware;
pub mod routes;
pub mod state;
