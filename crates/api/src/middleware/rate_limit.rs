//! Edge rate limiting for API requests.
//!
//! Every request under `/api` is counted against the caller's tier. Allowed
//! responses carry `X-RateLimit-*` headers; denied requests get a 429 with the
//! same headers and no handler runs.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

use courier_common::error::AppError;
use courier_common::types::RateLimitHeaders;
use courier_engine::RateLimitError;

use crate::middleware::auth::Caller;
use crate::state::AppState;

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let caller = Caller::from_headers(
        request.headers(),
        &state.config.jwt_secret,
        state.config.trust_gateway_headers,
    )?;
    let client_ip = client_ip(&request, state.config.trust_proxy_headers);

    match state.rate_limiter.check_request(&caller.0, &client_ip).await {
        Ok(headers) => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &headers);
            Ok(response)
        }
        Err(RateLimitError::Exceeded(headers)) => {
            tracing::warn!(
                tier = %headers.tier,
                client_ip = %client_ip,
                client_id = caller.client_id().unwrap_or("-"),
                "Request rate limited"
            );
            state
                .dispatcher
                .telemetry()
                .increment_counter("requests_rate_limited", &[("tier", &headers.tier)]);
            Err(AppError::RateLimited(headers))
        }
        Err(RateLimitError::StoreUnavailable(reason)) => Err(AppError::Unavailable(format!(
            "rate limiting unavailable: {reason}"
        ))),
    }
}

/// The socket peer address, or "unknown" when no connect info is attached.
///
/// With `trust_proxy` set, the first `X-Forwarded-For` entry and then
/// `X-Real-IP` take precedence over the peer.
pub fn client_ip(request: &Request, trust_proxy: bool) -> String {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    if trust_proxy
        && let Some(forwarded) = header("x-forwarded-for")
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return first.to_string();
    }
    if trust_proxy
        && let Some(real_ip) = header("x-real-ip").filter(|s| !s.trim().is_empty())
    {
        return real_ip.trim().to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn apply_headers(target: &mut HeaderMap, headers: &RateLimitHeaders) {
    for (name, value) in headers.to_header_pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            target.insert(HeaderName::from_static(name), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn make_request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/api/channels");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let request = make_request(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.2"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(client_ip(&request, true), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_ignores_proxy_headers_when_untrusted() {
        let mut request = make_request(&[
            ("x-forwarded-for", "203.0.113.7"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(client_ip(&request, false), "unknown");

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 9], 4000))));
        assert_eq!(client_ip(&request, false), "192.0.2.9");
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let request = make_request(&[("x-real-ip", "198.51.100.1")]);
        assert_eq!(client_ip(&request, true), "198.51.100.1");

        let mut request = make_request(&[]);
        assert_eq!(client_ip(&request, true), "unknown");

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 4000))));
        assert_eq!(client_ip(&request, true), "192.0.2.4");
    }
}
