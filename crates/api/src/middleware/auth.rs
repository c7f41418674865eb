//! Caller identification for rate limiting.
//!
//! A caller is described either by a signed JWT (`Authorization: Bearer <token>`)
//! or, when the deployment sits behind a gateway and `TRUST_GATEWAY_HEADERS` is
//! set, by the `X-Client-*` / `X-User-ID` / `X-OAuth-Scopes` headers the gateway
//! injects. Everything else is anonymous and limited by IP.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use courier_common::error::AppError;
use courier_engine::ratelimit::ClientRateLimitInfo;

use crate::state::AppState;

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject: the end user the client acts for
    pub sub: String,
    /// OAuth client the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub first_party: bool,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub admin: bool,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

impl Claims {
    /// Claims for `sub` acting through `client_id`, valid for `expiry_hours`.
    pub fn new(sub: impl Into<String>, client_id: Option<String>, expiry_hours: u64) -> Self {
        let now = Utc::now();
        Self {
            sub: sub.into(),
            client_id,
            scopes: Vec::new(),
            first_party: false,
            trusted: false,
            admin: false,
            exp: (now + Duration::hours(expiry_hours as i64)).timestamp(),
            iat: now.timestamp(),
        }
    }
}

impl From<Claims> for ClientRateLimitInfo {
    fn from(claims: Claims) -> Self {
        Self {
            client_id: claims.client_id,
            user_id: Some(claims.sub).filter(|s| !s.is_empty()),
            scopes: claims.scopes,
            first_party: claims.first_party,
            trusted: claims.trusted,
            admin: claims.admin,
        }
    }
}

/// Encode signed claims.
pub fn encode_jwt(claims: &Claims, secret: &str) -> Result<String, AppError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

/// Caller attributes resolved from the request.
///
/// Never rejects a request without credentials; only a bearer token that
/// fails verification is an error.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub ClientRateLimitInfo);

impl Caller {
    /// Resolve the caller from `headers`, preferring a bearer token over gateway headers.
    ///
    /// Gateway headers are only read when `trust_gateway` is set; otherwise
    /// they are client-controlled and ignored.
    pub fn from_headers(
        headers: &HeaderMap,
        secret: &str,
        trust_gateway: bool,
    ) -> Result<Self, AppError> {
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));

        if let Some(token) = bearer {
            let claims = decode_jwt(token.trim(), secret)?;
            return Ok(Caller(claims.into()));
        }

        if trust_gateway {
            return Ok(Caller(gateway_info(headers)));
        }
        Ok(Caller::default())
    }

    pub fn client_id(&self) -> Option<&str> {
        self.0.client_id.as_deref().filter(|c| !c.is_empty())
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let result = Caller::from_headers(
            &parts.headers,
            &state.config.jwt_secret,
            state.config.trust_gateway_headers,
        );
        async move { result }
    }
}

fn gateway_info(headers: &HeaderMap) -> ClientRateLimitInfo {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let flag = |name: &str| text(name).is_some_and(|v| v.eq_ignore_ascii_case("true"));

    ClientRateLimitInfo {
        client_id: text("x-client-id"),
        user_id: text("x-user-id"),
        scopes: text("x-oauth-scopes")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        first_party: flag("x-client-first-party"),
        trusted: flag("x-client-trusted"),
        admin: flag("x-client-admin"),
    }
}
