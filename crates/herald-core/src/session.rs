//! Session identity, per-run records, and the process-wide registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::classify;
use crate::creds::CredStore;
use crate::error::{Error, Result};
use crate::supervisor;

/// Characters exposed in the status output tail.
const OUTPUT_TAIL_CHARS: usize = 500;

/// Composite identifier for one isolated messaging session. Doubles as the
/// registry map key and as the on-disk directory path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    /// Tenant name.
    pub tenant: String,
    /// Branch within the tenant.
    pub branch_id: i64,
}

impl SessionKey {
    /// Build a key, rejecting tenants that cannot serve as a path segment.
    pub fn new(tenant: impl Into<String>, branch_id: i64) -> Result<Self> {
        let tenant = tenant.into();
        if tenant.trim().is_empty() {
            return Err(Error::Validation("tenant must not be empty".to_string()));
        }
        if tenant.contains('/') || tenant.contains('\\') || tenant.contains("..") {
            return Err(Error::Validation(format!(
                "tenant {tenant:?} is not a valid path segment"
            )));
        }
        Ok(Self { tenant, branch_id })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.branch_id)
    }
}

/// Connection state of a session run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process started, no QR or terminal phrase seen yet.
    Waiting,
    /// QR content detected; pairing material available.
    QrReady,
    /// Authenticated.
    Connected,
    /// Terminal failure for this run.
    Error,
}

/// Out-of-band pairing material extracted from client output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrPayload {
    /// Scannable pairing URL. Preferred when present.
    Url(String),
    /// Terminal rendering of the QR code.
    AsciiArt(String),
}

impl QrPayload {
    /// URL form, if this payload is one.
    pub fn url(&self) -> Option<&str> {
        match self {
            QrPayload::Url(url) => Some(url),
            QrPayload::AsciiArt(_) => None,
        }
    }

    /// ASCII-art form, if this payload is one.
    pub fn ascii_art(&self) -> Option<&str> {
        match self {
            QrPayload::Url(_) => None,
            QrPayload::AsciiArt(art) => Some(art),
        }
    }
}

/// Mutable state for the current or last client run of a session.
///
/// The record outlives the process: detach timers and exit reconciliation
/// clear `pid` but keep the record for later status polls. Only explicit
/// cancellation or a fresh login replaces it.
#[derive(Debug)]
pub struct SessionRecord {
    /// Current state per the classifier.
    pub state: SessionState,
    /// Accumulated stdout/stderr for this run.
    pub output: String,
    /// Extracted pairing material, if any.
    pub qr: Option<QrPayload>,
    /// Pid of the live child process; `None` once exited or detached.
    pub pid: Option<u32>,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
}

impl SessionRecord {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            state: SessionState::Waiting,
            output: String::new(),
            qr: None,
            pid: Some(pid),
            started_at: Utc::now(),
        }
    }
}

/// Shared handle to a session record.
pub type SharedRecord = Arc<Mutex<SessionRecord>>;

/// Live view of a session for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Current state.
    pub state: SessionState,
    /// Pairing URL, when the QR payload is a URL.
    pub qr_url: Option<String>,
    /// Terminal QR rendering, when no URL was found.
    pub qr_ascii_art: Option<String>,
    /// Bounded tail of the run output.
    pub output: String,
    /// Whether a client process is currently attached.
    pub is_running: bool,
    /// Spawn time of the run, absent for synthesized cache statuses.
    pub started_at: Option<DateTime<Utc>>,
    /// True when synthesized from the credential file with no live record.
    pub is_from_cache: bool,
}

/// Last `max_chars` characters of `s`, on a char boundary.
fn output_tail(s: &str, max_chars: usize) -> &str {
    match s.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Process-wide map from (tenant, branch) to the active session record.
///
/// Enforces the single-login invariant: the supervisor consults the registry
/// before spawning, and a key with a live pid never gets a second login
/// process.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, SharedRecord>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Shared handle for a key, if a record exists.
    pub async fn get(&self, key: &SessionKey) -> Option<SharedRecord> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Install a fresh record for a key, replacing any previous one.
    pub(crate) async fn insert(&self, key: SessionKey, record: SessionRecord) -> SharedRecord {
        let shared = Arc::new(Mutex::new(record));
        self.sessions.write().await.insert(key, shared.clone());
        shared
    }

    /// Drop the record for a key.
    pub(crate) async fn remove(&self, key: &SessionKey) -> Option<SharedRecord> {
        self.sessions.write().await.remove(key)
    }

    /// Status for a key: a live view of the in-memory record when one
    /// exists, else a status synthesized from the credential file, else
    /// `None` (never logged in or fully logged out).
    pub async fn status(
        &self,
        key: &SessionKey,
        store: &CredStore,
    ) -> Result<Option<StatusReport>> {
        if let Some(shared) = self.get(key).await {
            let mut rec = shared.lock().await;
            // Exit handlers may not have run yet; upgrade a QR-ready record
            // whose output already carries the login-success markers.
            if rec.state == SessionState::QrReady && classify::has_login_success(&rec.output) {
                debug!(session = %key, "upgrading qr_ready record to connected");
                rec.state = SessionState::Connected;
            }
            return Ok(Some(StatusReport {
                state: rec.state,
                qr_url: rec.qr.as_ref().and_then(QrPayload::url).map(String::from),
                qr_ascii_art: rec
                    .qr
                    .as_ref()
                    .and_then(QrPayload::ascii_art)
                    .map(String::from),
                output: output_tail(&rec.output, OUTPUT_TAIL_CHARS).to_string(),
                is_running: rec.pid.is_some(),
                started_at: Some(rec.started_at),
                is_from_cache: false,
            }));
        }

        match store.read(key).await? {
            Some(content) if !content.trim().is_empty() => {
                let state_keys = store.state_key_files(key).await.unwrap_or_default();
                let reason = if state_keys.is_empty() {
                    "credentials file found with content".to_string()
                } else {
                    format!(
                        "credentials file found with content and {} app state key file(s)",
                        state_keys.len()
                    )
                };
                Ok(Some(StatusReport {
                    state: SessionState::Connected,
                    qr_url: None,
                    qr_ascii_art: None,
                    output: format!("Connection established ({reason})"),
                    is_running: false,
                    started_at: None,
                    is_from_cache: true,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Terminate the live process for a key, if any, and evict the record.
    /// Returns whether a process was actually cancelled. No grace period:
    /// explicit cancellation is immediate.
    pub async fn cancel(&self, key: &SessionKey) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(shared) = sessions.get(key) {
            let pid = shared.lock().await.pid;
            if let Some(pid) = pid {
                info!(session = %key, pid, "cancelling login process");
                supervisor::send_signal(pid, nix::sys::signal::Signal::SIGTERM);
                sessions.remove(key);
                return true;
            }
        }
        false
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
