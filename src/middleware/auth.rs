//! Authentication middleware for Axum
//!
//! Extracts the API key from requests and validates it against the
//! configured key. Provides the `RequireApiKey` extractor for handlers.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::server::config::AuthConfig;

/// JSON error response for auth failures
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    success: bool,
    error: String,
    code: String,
}

impl AuthErrorResponse {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: code.into(),
        }
    }
}

/// Auth rejection type
pub struct AuthRejection {
    status: StatusCode,
    body: AuthErrorResponse,
}

impl AuthRejection {
    fn missing() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: AuthErrorResponse::new(
                "Authentication required. Provide the X-API-Key header.",
                "UNAUTHORIZED",
            ),
        }
    }

    fn invalid() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: AuthErrorResponse::new("Invalid API key", "INVALID_CREDENTIALS"),
        }
    }

    fn misconfigured() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: AuthErrorResponse::new(
                "Authentication is enabled but no API key is configured",
                "INTERNAL_ERROR",
            ),
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Axum extractor that requires a valid API key when authentication is
/// enabled.
///
/// Extracts the key from:
/// 1. `X-API-Key: <key>` header
/// 2. `Authorization: Bearer <key>` header
pub struct RequireApiKey;

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequireApiKey
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth = parts
            .extensions
            .get::<Arc<AuthConfig>>()
            .ok_or_else(AuthRejection::misconfigured)?;

        if !auth.enabled {
            return Ok(RequireApiKey);
        }
        let expected = auth.api_key.as_deref().ok_or_else(AuthRejection::misconfigured)?;
        let provided = extract_key(parts).ok_or_else(AuthRejection::missing)?;
        if provided != expected {
            return Err(AuthRejection::invalid());
        }
        Ok(RequireApiKey)
    }
}

/// Extract the API key from request headers
fn extract_key(parts: &Parts) -> Option<String> {
    if let Some(header) = parts.headers.get("x-api-key") {
        if let Ok(value) = header.to_str() {
            return Some(value.trim().to_string());
        }
    }
    if let Some(header) = parts.headers.get("authorization") {
        if let Ok(value) = header.to_str() {
            if let Some(key) = value.strip_prefix("Bearer ") {
                return Some(key.trim().to_string());
            }
        }
    }
    None
}
