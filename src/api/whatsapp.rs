//! WhatsApp session endpoints.
//!
//! All endpoints are POST and take the (tenant, branch_id) pair in the JSON
//! body. Pairing endpoints manage the login lifecycle; send endpoints run a
//! client command against an already-paired session.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use herald_core::{
    ClientCommand, Error as EngineError, SessionKey, SessionState, Supervisor,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::middleware::auth::RequireApiKey;

/// Characters of client output echoed back in responses.
const OUTPUT_TAIL_CHARS: usize = 500;

fn tail(s: &str) -> String {
    match s.char_indices().rev().nth(OUTPUT_TAIL_CHARS.saturating_sub(1)) {
        Some((idx, _)) => s[idx..].to_string(),
        None => s.to_string(),
    }
}

// ============================================================================
// Error mapping
// ============================================================================

/// Engine error wrapped for HTTP transport.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    creds_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    solution: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_tail: Option<String>,
}

impl ErrorBody {
    fn new(error: String, code: &'static str) -> Self {
        Self {
            success: false,
            error,
            code,
            creds_status: None,
            last_state: None,
            solution: None,
            output_tail: None,
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation(_) | EngineError::NotConnected { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EngineError::ProcessExit { .. } => StatusCode::BAD_GATEWAY,
            EngineError::Spawn(_) | EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self.0 {
            EngineError::Validation(msg) => ErrorBody::new(msg, "VALIDATION"),
            EngineError::NotConnected {
                key,
                presence,
                state,
            } => ErrorBody {
                creds_status: Some(presence.to_string()),
                last_state: state,
                solution: Some(vec![
                    "Call POST /api/v1/whatsapp/login to start pairing",
                    "Scan the returned QR code with the WhatsApp mobile app",
                    "Poll POST /api/v1/whatsapp/login/status until status is connected",
                    "Retry this request",
                ]),
                ..ErrorBody::new(
                    format!("Session {key} is not connected"),
                    "NOT_CONNECTED",
                )
            },
            EngineError::Timeout { timeout, output } => ErrorBody {
                output_tail: Some(tail(&output)),
                ..ErrorBody::new(
                    format!("Client command timed out after {}s", timeout.as_secs()),
                    "TIMEOUT",
                )
            },
            EngineError::ProcessExit { code, output } => ErrorBody {
                output_tail: Some(tail(&output)),
                ..ErrorBody::new(
                    format!("Messaging client failed with exit code {code:?}"),
                    "CLIENT_FAILED",
                )
            },
            EngineError::Spawn(e) => {
                error!(error = %e, "failed to spawn messaging client");
                ErrorBody::new(
                    "Failed to start the messaging client".to_string(),
                    "INTERNAL_ERROR",
                )
            }
            EngineError::Io(e) => {
                error!(error = %e, "session storage error");
                ErrorBody::new("Session storage error".to_string(), "INTERNAL_ERROR")
            }
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Request / response types
// ============================================================================

/// Body identifying one session.
#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub tenant: String,
    pub branch_id: i64,
}

impl SessionRequest {
    fn key(&self) -> Result<SessionKey, ApiError> {
        Ok(SessionKey::new(self.tenant.clone(), self.branch_id)?)
    }
}

/// Body for POST /api/v1/whatsapp/send
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub tenant: String,
    pub branch_id: i64,
    pub recipient: String,
    pub message: String,
}

/// Body for POST /api/v1/whatsapp/send-file
#[derive(Debug, Deserialize)]
pub struct SendFileRequest {
    pub tenant: String,
    pub branch_id: i64,
    pub recipient: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Response for POST /api/v1/whatsapp/login
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub status: SessionState,
    pub is_existing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_ascii_art_base64: Option<String>,
    pub message: &'static str,
    pub output_tail: String,
}

/// Response for POST /api/v1/whatsapp/login/status
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub status: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_ascii_art_base64: Option<String>,
    pub is_running: bool,
    pub is_from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub output_tail: String,
}

/// Response for POST /api/v1/whatsapp/login/cancel
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub cancelled: bool,
}

/// Response for logout and send endpoints
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: &'static str,
    pub output_tail: String,
}

fn encode_qr_art(art: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(art)
}

fn login_message(state: SessionState, is_existing: bool) -> &'static str {
    match state {
        SessionState::QrReady if is_existing => "Pairing already in progress, QR code attached",
        SessionState::QrReady => "Scan the QR code with the WhatsApp mobile app",
        SessionState::Connected => "Session is connected",
        SessionState::Error => "Login failed, see output_tail",
        SessionState::Waiting => "Login is still starting, poll login/status",
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/whatsapp/login handler.
async fn login(
    RequireApiKey: RequireApiKey,
    Extension(supervisor): Extension<Arc<Supervisor>>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let key = req.key()?;
    let outcome = supervisor.login(&key).await?;
    Ok(Json(LoginResponse {
        success: outcome.state != SessionState::Error,
        status: outcome.state,
        is_existing: outcome.is_existing,
        qr_url: outcome.qr.as_ref().and_then(|q| q.url()).map(String::from),
        qr_ascii_art_base64: outcome
            .qr
            .as_ref()
            .and_then(|q| q.ascii_art())
            .map(encode_qr_art),
        message: login_message(outcome.state, outcome.is_existing),
        output_tail: tail(&outcome.output),
    }))
}

/// POST /api/v1/whatsapp/login/status handler.
async fn login_status(
    RequireApiKey: RequireApiKey,
    Extension(supervisor): Extension<Arc<Supervisor>>,
    Json(req): Json<SessionRequest>,
) -> Result<Response, ApiError> {
    let key = req.key()?;
    match supervisor.status(&key).await? {
        Some(report) => Ok(Json(StatusResponse {
            success: true,
            status: report.state,
            qr_url: report.qr_url,
            qr_ascii_art_base64: report.qr_ascii_art.as_deref().map(encode_qr_art),
            is_running: report.is_running,
            is_from_cache: report.is_from_cache,
            started_at: report.started_at,
            output_tail: tail(&report.output),
        })
        .into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(
                format!("No session found for {key}"),
                "NOT_FOUND",
            )),
        )
            .into_response()),
    }
}

/// POST /api/v1/whatsapp/login/cancel handler.
async fn login_cancel(
    RequireApiKey: RequireApiKey,
    Extension(supervisor): Extension<Arc<Supervisor>>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    let key = req.key()?;
    let cancelled = supervisor.cancel(&key).await;
    Ok(Json(CancelResponse {
        success: true,
        cancelled,
    }))
}

/// POST /api/v1/whatsapp/logout handler.
async fn logout(
    RequireApiKey: RequireApiKey,
    Extension(supervisor): Extension<Arc<Supervisor>>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let key = req.key()?;
    let output = supervisor.run_command(&key, ClientCommand::Logout).await?;
    Ok(Json(CommandResponse {
        success: true,
        message: "Logged out, session credentials removed",
        output_tail: tail(&output),
    }))
}

/// POST /api/v1/whatsapp/send handler.
async fn send_message(
    RequireApiKey: RequireApiKey,
    Extension(supervisor): Extension<Arc<Supervisor>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let key = SessionKey::new(req.tenant, req.branch_id)?;
    if req.recipient.trim().is_empty() {
        return Err(EngineError::Validation("recipient must not be empty".to_string()).into());
    }
    if req.message.trim().is_empty() {
        return Err(EngineError::Validation("message must not be empty".to_string()).into());
    }
    let output = supervisor
        .run_command(
            &key,
            ClientCommand::Send {
                recipient: req.recipient,
                message: req.message,
            },
        )
        .await?;
    Ok(Json(CommandResponse {
        success: true,
        message: "Message sent",
        output_tail: tail(&output),
    }))
}

/// POST /api/v1/whatsapp/send-file handler.
async fn send_file(
    RequireApiKey: RequireApiKey,
    Extension(supervisor): Extension<Arc<Supervisor>>,
    Json(req): Json<SendFileRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let key = SessionKey::new(req.tenant, req.branch_id)?;
    if req.recipient.trim().is_empty() {
        return Err(EngineError::Validation("recipient must not be empty".to_string()).into());
    }
    // Preflight: a bad path should fail here, not as an opaque client error.
    match tokio::fs::metadata(&req.file_path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            return Err(EngineError::Validation(format!(
                "file_path {} is not a regular file",
                req.file_path.display()
            ))
            .into());
        }
        Err(_) => {
            return Err(EngineError::Validation(format!(
                "file_path {} does not exist or is not readable",
                req.file_path.display()
            ))
            .into());
        }
    }
    let output = supervisor
        .run_command(
            &key,
            ClientCommand::SendFile {
                recipient: req.recipient,
                path: req.file_path,
                caption: req.caption,
            },
        )
        .await?;
    Ok(Json(CommandResponse {
        success: true,
        message: "File sent",
        output_tail: tail(&output),
    }))
}

/// Create the WhatsApp routes.
pub fn whatsapp_routes() -> Router {
    Router::new()
        .route("/api/v1/whatsapp/login", post(login))
        .route("/api/v1/whatsapp/login/status", post(login_status))
        .route("/api/v1/whatsapp/login/cancel", post(login_cancel))
        .route("/api/v1/whatsapp/logout", post(logout))
        .route("/api/v1/whatsapp/send", post(send_message))
        .route("/api/v1/whatsapp/send-file", post(send_file))
}
