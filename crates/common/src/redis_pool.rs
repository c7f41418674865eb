use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager backing the rate-limit counters.
///
/// The manager reconnects on its own, so callers clone it freely.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!(redis_url = %redact(redis_url), "Connected to Redis");
    Ok(manager)
}

/// Strip credentials from a connection URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_password() {
        assert_eq!(redact("redis://:hunter2@cache:6379"), "redis://***@cache:6379");
        assert_eq!(redact("redis://localhost:6379"), "redis://localhost:6379");
    }
}
