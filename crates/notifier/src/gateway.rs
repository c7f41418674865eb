//! Shared HTTP plumbing for gateway-backed providers.
//!
//! Gateways speak HTTP, while the classifier speaks SMTP-style transport codes.
//! This module owns the translation between the two.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::provider::TransportError;

/// Longest response body kept on a [`TransportError`].
const MAX_DETAIL_LEN: usize = 512;

/// Thin wrapper over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
}

impl GatewayClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// POST `body` as JSON and return the parsed JSON response on 2xx.
    ///
    /// Any other outcome is mapped to a transport code.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, TransportError> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::cancelled()),
            result = request.send() => result.map_err(network_error)?,
        };

        let status = response.status();
        if status.is_success() {
            // Gateways that answer with an empty or non-JSON body still accepted the message
            return Ok(response.json().await.unwrap_or(serde_json::Value::Null));
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status).with_detail(truncate(&body)))
    }
}

/// Translate a non-2xx gateway status into a transport error.
///
/// The message text is fixed per status so that gateway-specific body text
/// cannot steer classification.
pub fn status_error(status: StatusCode) -> TransportError {
    let code = status.as_u16();
    match code {
        401 | 403 => TransportError::new(454, format!("authentication rejected by gateway (HTTP {code})")),
        404 | 410 => TransportError::new(550, format!("recipient address not found (HTTP {code})")),
        400 | 422 => TransportError::new(501, format!("gateway rejected request parameters (HTTP {code})")),
        413 => TransportError::new(554, format!("message too large for gateway (HTTP {code})")),
        429 => TransportError::new(451, format!("too many requests (HTTP {code})")),
        503 => TransportError::new(421, format!("gateway unavailable (HTTP {code})")),
        500..=599 => TransportError::new(451, format!("server error at gateway (HTTP {code})")),
        _ => TransportError::new(554, format!("gateway refused message (HTTP {code})")),
    }
}

fn network_error(err: reqwest::Error) -> TransportError {
    let message = if err.is_timeout() {
        "network timeout contacting gateway".to_string()
    } else if err.is_connect() {
        "connection to gateway failed".to_string()
    } else {
        "network error contacting gateway".to_string()
    };
    TransportError::new(451, message).with_detail(truncate(&err.to_string()))
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_DETAIL_LEN) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
