//! Shared domain types, configuration, errors and connection helpers.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
