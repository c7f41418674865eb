use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (rate-limit counters)
    pub redis_url: String,

    /// Service name used as the rate-limit key namespace
    pub service_name: String,

    /// Address the HTTP API binds to
    pub bind_addr: String,

    /// JWT secret used to verify caller claims
    pub jwt_secret: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Timeout for every backing-store call in milliseconds (default: 2000)
    pub store_timeout_ms: u64,

    /// Recipients processed concurrently per message (default: 16)
    pub max_concurrent_recipients: usize,

    /// Provider calls in flight across all messages (default: 64)
    pub max_concurrent_deliveries: usize,

    /// Email gateway endpoint (Resend-compatible)
    pub email_gateway_url: Option<String>,

    /// Email gateway API key
    pub email_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// SMS gateway endpoint
    pub sms_gateway_url: Option<String>,

    /// Push gateway endpoint
    pub push_gateway_url: Option<String>,

    /// Whether webhook delivery is registered
    pub webhook_enabled: bool,

    /// Allow requests through when the counter store is unreachable (default: true)
    pub rate_limit_fail_open: bool,

    /// Accept `X-Client-*` caller headers injected by an upstream gateway (default: false)
    pub trust_gateway_headers: bool,

    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP` (default: false)
    pub trust_proxy_headers: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "courier".to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            store_timeout_ms: std::env::var("STORE_TIMEOUT_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("STORE_TIMEOUT_MS must be a valid u64"))?,
            max_concurrent_recipients: std::env::var("MAX_CONCURRENT_RECIPIENTS")
                .unwrap_or_else(|_| "16".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_CONCURRENT_RECIPIENTS must be a valid usize"))?,
            max_concurrent_deliveries: std::env::var("MAX_CONCURRENT_DELIVERIES")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_CONCURRENT_DELIVERIES must be a valid usize"))?,
            email_gateway_url: std::env::var("EMAIL_GATEWAY_URL").ok(),
            email_api_key: std::env::var("EMAIL_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            sms_gateway_url: std::env::var("SMS_GATEWAY_URL").ok(),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            webhook_enabled: parse_flag("WEBHOOK_ENABLED", true)?,
            rate_limit_fail_open: parse_flag("RATE_LIMIT_FAIL_OPEN", true)?,
            trust_gateway_headers: parse_flag("TRUST_GATEWAY_HEADERS", false)?,
            trust_proxy_headers: parse_flag("TRUST_PROXY_HEADERS", false)?,
        })
    }
}

fn parse_flag(name: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!("{name} must be a boolean")),
        },
    }
}
