//! Process supervision for the external messaging client.
//!
//! The client is a terminal program driven one invocation at a time. A login
//! invocation stays attached until pairing material or a terminal state shows
//! up in its output; non-login invocations run under a hard time budget with
//! the credential guard armed. All state inference goes through [`classify`];
//! this module owns spawning, stream plumbing, timers, and signals.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classify;
use crate::config::EngineConfig;
use crate::creds::CredStore;
use crate::error::{CredsPresence, Error, Result};
use crate::guard::{self, CredentialGuard};
use crate::session::{
    QrPayload, SessionKey, SessionRecord, SessionRegistry, SessionState, SharedRecord,
    StatusReport,
};

/// Stand-in deadline for a disarmed race timer.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Stream read granularity. Output arrives in small flushes; 4 KiB is ample.
const READ_CHUNK_BYTES: usize = 4096;

/// Deliver a signal to a pid, logging delivery failures. The process may
/// have exited already; that is not an error worth surfacing.
pub(crate) fn send_signal(pid: u32, sig: Signal) {
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!(pid, signal = %sig, error = %e, "signal delivery failed");
    }
}

/// Forward a child stream to the chunk channel as lossy UTF-8.
fn spawn_stream_reader<R>(mut reader: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Clear the pid on a record after a delay, leaving the record in place for
/// later status polls. The process itself runs to natural exit.
fn detach_after(shared: SharedRecord, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        shared.lock().await.pid = None;
    });
}

/// A non-login client invocation.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Unpair the session and drop its credentials.
    Logout,
    /// Send a text message.
    Send {
        /// Phone number or group id.
        recipient: String,
        /// Message body.
        message: String,
    },
    /// Send a file with an optional caption.
    SendFile {
        /// Phone number or group id.
        recipient: String,
        /// Local path of the file to send.
        path: PathBuf,
        /// Caption shown with the file.
        caption: Option<String>,
    },
}

impl ClientCommand {
    /// Command verb, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Logout => "logout",
            ClientCommand::Send { .. } => "send",
            ClientCommand::SendFile { .. } => "send-file",
        }
    }

    /// Whether this command intentionally removes the credential artifact.
    pub fn is_logout(&self) -> bool {
        matches!(self, ClientCommand::Logout)
    }

    fn args(&self) -> Vec<OsString> {
        match self {
            ClientCommand::Logout => vec!["logout".into()],
            ClientCommand::Send { recipient, message } => {
                vec!["send".into(), recipient.into(), message.into()]
            }
            ClientCommand::SendFile {
                recipient,
                path,
                caption,
            } => {
                let mut args: Vec<OsString> =
                    vec!["send-file".into(), recipient.into(), path.into()];
                if let Some(caption) = caption {
                    args.push("--caption".into());
                    args.push(caption.into());
                }
                args
            }
        }
    }
}

/// What a login attempt produced by the time it resolved.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Session state at resolution.
    pub state: SessionState,
    /// Accumulated client output.
    pub output: String,
    /// Pairing material, when one was extracted.
    pub qr: Option<QrPayload>,
    /// True when an already-running login was reused instead of spawning.
    pub is_existing: bool,
}

/// Orchestrates client processes for all sessions.
pub struct Supervisor {
    config: EngineConfig,
    store: CredStore,
    registry: Arc<SessionRegistry>,
    // Serializes the reuse-check / spawn / insert section of `login` so two
    // concurrent logins for one key can never both spawn. Held only for the
    // registry lookup and the (synchronous) spawn.
    login_gate: Mutex<()>,
}

impl Supervisor {
    /// Build a supervisor over the configured state directory.
    pub fn new(config: EngineConfig) -> Self {
        let store = CredStore::new(config.base_dir.clone());
        Self {
            config,
            store,
            registry: Arc::new(SessionRegistry::new()),
            login_gate: Mutex::new(()),
        }
    }

    /// Credential store backing this supervisor.
    pub fn store(&self) -> &CredStore {
        &self.store
    }

    /// Current status of a session. See [`SessionRegistry::status`].
    pub async fn status(&self, key: &SessionKey) -> Result<Option<StatusReport>> {
        self.registry.status(key, &self.store).await
    }

    /// Terminate a live login process for a session, if any.
    pub async fn cancel(&self, key: &SessionKey) -> bool {
        self.registry.cancel(key).await
    }

    fn base_command(&self, session_dir: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.config.client_bin);
        cmd.args(&self.config.client_prefix_args)
            .arg("-c")
            .arg(session_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Start (or reuse) a login for a session and wait until it resolves.
    ///
    /// Resolution happens on the first of: QR payload settled, terminal
    /// state reached, process exit, or the overall wait budget elapsing.
    /// The process itself may keep running after resolution; a background
    /// driver keeps classifying its output and reconciles the exit status.
    pub async fn login(&self, key: &SessionKey) -> Result<LoginOutcome> {
        let dir = self.store.ensure_branch_dir(key).await?;

        // Reuse check, spawn, and record insertion happen under one gate:
        // at most one live login process per key, ever.
        let (mut child, shared) = {
            let _gate = self.login_gate.lock().await;

            if let Some(shared) = self.registry.get(key).await {
                let rec = shared.lock().await;
                if rec.pid.is_some() {
                    info!(session = %key, "login already in progress, returning current state");
                    return Ok(LoginOutcome {
                        state: rec.state,
                        output: rec.output.clone(),
                        qr: rec.qr.clone(),
                        is_existing: true,
                    });
                }
                drop(rec);
                // Dead record from a previous run; a fresh login replaces it.
                self.registry.remove(key).await;
            }

            let child = self
                .base_command(&dir)
                .arg("login")
                .spawn()
                .map_err(Error::Spawn)?;
            let pid = child
                .id()
                .ok_or_else(|| Error::Spawn(std::io::Error::other("process exited before start")))?;
            info!(session = %key, pid, "login process started");

            let shared = self.registry.insert(key.clone(), SessionRecord::new(pid)).await;
            (child, shared)
        };

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_stream_reader(stdout, chunk_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stream_reader(stderr, chunk_tx.clone());
        }
        drop(chunk_tx);

        let (resolve_tx, mut resolve_rx) = mpsc::channel::<()>(2);

        // Driver: owns the child, classifies chunks, reconciles the exit.
        {
            let shared = shared.clone();
            let key = key.clone();
            let timing = self.config.timing.clone();
            let resolve_tx = resolve_tx.clone();
            tokio::spawn(async move {
                let mut qr_seen = false;
                let mut resolved_ok = false;
                while let Some(chunk) = chunk_rx.recv().await {
                    let mut rec = shared.lock().await;
                    rec.output.push_str(&chunk);

                    if !qr_seen
                        && rec.state == SessionState::Waiting
                        && classify::has_qr_hint(&chunk)
                    {
                        qr_seen = true;
                        rec.state = SessionState::QrReady;
                        rec.qr = classify::qr_payload(&rec.output);
                        debug!(session = %key, "qr output detected, settling");
                        // Let late chunks complete the payload before the
                        // caller is resolved.
                        let shared = shared.clone();
                        let resolve_tx = resolve_tx.clone();
                        let settle = timing.qr_settle_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(settle).await;
                            let mut rec = shared.lock().await;
                            if rec.state == SessionState::QrReady {
                                if let Some(payload) = classify::qr_payload(&rec.output) {
                                    rec.qr = Some(payload);
                                }
                            }
                            drop(rec);
                            let _ = resolve_tx.try_send(());
                        });
                    }

                    if classify::has_disconnect_phrase(&chunk) {
                        warn!(session = %key, "remote side rejected the session");
                        rec.state = SessionState::Error;
                        drop(rec);
                        detach_after(shared.clone(), timing.error_detach_delay);
                        let _ = resolve_tx.try_send(());
                        continue;
                    }

                    if !resolved_ok
                        && (classify::has_login_success(&rec.output)
                            || classify::chunk_login_hint(&chunk))
                    {
                        resolved_ok = true;
                        info!(session = %key, "login succeeded");
                        rec.state = SessionState::Connected;
                        drop(rec);
                        detach_after(shared.clone(), timing.connected_detach_delay);
                        let _ = resolve_tx.try_send(());
                    }
                }

                // Streams closed; the process is done or moments from it.
                let code = child.wait().await.ok().and_then(|s| s.code());
                let mut rec = shared.lock().await;
                let success = classify::has_login_success(&rec.output);
                if classify::has_error_mark(&rec.output) {
                    rec.state = SessionState::Error;
                } else if code == Some(0) {
                    if success {
                        rec.state = SessionState::Connected;
                    } else if rec.state != SessionState::QrReady {
                        rec.state = SessionState::Error;
                    }
                } else if code.is_none() {
                    // Killed by a signal (cancellation or a detach race).
                    if success {
                        rec.state = SessionState::Connected;
                    }
                } else if success && rec.state == SessionState::Connected {
                    // Tolerated: the client sometimes exits non-zero after a
                    // successful pairing.
                } else {
                    rec.state = SessionState::Error;
                }
                rec.pid = None;
                debug!(session = %key, code = ?code, state = ?rec.state, "login process exited");
                drop(rec);
                let _ = resolve_tx.try_send(());
            });
        }
        drop(resolve_tx);

        tokio::select! {
            _ = resolve_rx.recv() => {}
            _ = tokio::time::sleep(self.config.timing.qr_wait_timeout) => {
                warn!(session = %key, "login did not resolve within the wait budget");
            }
        }

        let mut rec = shared.lock().await;
        if rec.qr.is_none() {
            rec.qr = classify::qr_payload(&rec.output);
            if rec.qr.is_some() && rec.state == SessionState::Waiting {
                rec.state = SessionState::QrReady;
            }
        }
        Ok(LoginOutcome {
            state: rec.state,
            output: rec.output.clone(),
            qr: rec.qr.clone(),
            is_existing: false,
        })
    }

    /// Whether the session can run a non-login command right now.
    async fn check_connected(&self, key: &SessionKey) -> Result<()> {
        let status = self.registry.status(key, &self.store).await?;
        match status {
            Some(s) if s.state == SessionState::Connected => Ok(()),
            Some(s) => {
                let presence = self.store.presence(key).await?;
                if presence == CredsPresence::Valid && s.state == SessionState::QrReady {
                    // Valid credentials from an earlier pairing outrank a
                    // stale QR record.
                    warn!(session = %key, "qr record is stale, credentials look valid, proceeding");
                    Ok(())
                } else {
                    Err(Error::NotConnected {
                        key: key.to_string(),
                        presence,
                        state: Some(s.state),
                    })
                }
            }
            None => {
                let presence = self.store.presence(key).await?;
                if presence == CredsPresence::Valid {
                    warn!(session = %key, "no session record but credentials look valid, proceeding");
                    Ok(())
                } else {
                    Err(Error::NotConnected {
                        key: key.to_string(),
                        presence,
                        state: None,
                    })
                }
            }
        }
    }

    /// Run a non-login client command to completion and return its output.
    ///
    /// Send commands arm the credential guard for the whole run. A stream
    /// reset after the message-sent marker starts a grace timer instead of
    /// failing; if the process is still alive when the timer fires, the send
    /// is treated as delivered and the process is put down in the
    /// background. Logout skips the connectivity gate and, on a clean exit,
    /// removes the credential artifact.
    pub async fn run_command(&self, key: &SessionKey, command: ClientCommand) -> Result<String> {
        let dir = self.store.ensure_branch_dir(key).await?;
        if !command.is_logout() {
            self.check_connected(key).await?;
        }

        let mut guard = if command.is_logout() {
            None
        } else {
            Some(
                CredentialGuard::arm(
                    self.store.clone(),
                    key.clone(),
                    self.config.timing.creds_poll_interval,
                )
                .await,
            )
        };

        info!(session = %key, command = command.name(), "running client command");
        let mut child = self
            .base_command(&dir)
            .arg("-v")
            .args(command.args())
            .env("CI", "true")
            .env("FORCE_COLOR", "0")
            .spawn()
            .map_err(Error::Spawn)?;
        let pid = child.id();

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_stream_reader(stdout, chunk_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stream_reader(stderr, chunk_tx.clone());
        }
        drop(chunk_tx);

        let timing = &self.config.timing;
        let mut output = String::new();
        let mut message_sent = false;
        let mut stream_error = false;
        let mut conflict = false;
        let exit_code: Option<i32>;

        let overall = tokio::time::sleep(timing.command_timeout);
        tokio::pin!(overall);
        let race = tokio::time::sleep(FAR_FUTURE);
        tokio::pin!(race);
        let mut race_armed = false;

        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => {
                    match chunk {
                        Some(chunk) => {
                            output.push_str(&chunk);

                            if !message_sent && classify::has_message_sent(&output) {
                                message_sent = true;
                                debug!(session = %key, "message dispatch detected");
                                if let Some(guard) = guard.as_ref() {
                                    guard.snapshot_if_missing().await;
                                }
                            }
                            if !conflict && classify::has_conflict(&output) {
                                conflict = true;
                                if race_armed {
                                    // A conflict earns the longer settle
                                    // window.
                                    race.as_mut().reset(
                                        tokio::time::Instant::now() + timing.conflict_grace,
                                    );
                                }
                            }
                            if !stream_error && classify::has_stream_error(&output) {
                                stream_error = true;
                                if message_sent {
                                    warn!(
                                        session = %key,
                                        conflict,
                                        "stream reset after dispatch, starting grace timer"
                                    );
                                    if let Some(guard) = guard.as_ref() {
                                        guard.check_and_restore().await;
                                    }
                                    let grace = if conflict {
                                        timing.conflict_grace
                                    } else {
                                        timing.stream_error_grace
                                    };
                                    race.as_mut().reset(tokio::time::Instant::now() + grace);
                                    race_armed = true;
                                }
                            }
                        }
                        None => {
                            exit_code = child.wait().await.ok().and_then(|s| s.code());
                            break;
                        }
                    }
                }
                _ = &mut race, if race_armed => {
                    // The process survived its grace window after a
                    // dispatched message; call the send delivered and put
                    // the process down in the background.
                    info!(session = %key, "grace timer elapsed, treating send as delivered");
                    let backup = match guard.take() {
                        Some(mut guard) => {
                            guard.check_and_restore().await;
                            let backup = guard.backup().await;
                            guard.disarm();
                            backup
                        }
                        None => None,
                    };
                    self.spawn_kill_sequence(key.clone(), pid, backup);
                    return Ok(output);
                }
                _ = &mut overall => {
                    warn!(
                        session = %key,
                        command = command.name(),
                        "command exceeded its time budget"
                    );
                    if message_sent {
                        if stream_error || conflict {
                            if let Some(guard) = guard.as_ref() {
                                guard.refresh_snapshot().await;
                            }
                        }
                        // Same settle rule as the in-flight race: a device
                        // conflict gets the longer window.
                        let grace = if conflict {
                            timing.conflict_grace
                        } else {
                            timing.stream_error_grace
                        };
                        tokio::time::sleep(grace).await;
                        let backup = match guard.take() {
                            Some(mut guard) => {
                                guard.check_and_restore().await;
                                let backup = guard.backup().await;
                                guard.disarm();
                                backup
                            }
                            None => None,
                        };
                        self.spawn_kill_sequence(key.clone(), pid, backup);
                        return Ok(output);
                    }
                    if let Some(mut guard) = guard.take() {
                        guard.disarm();
                    }
                    if let Some(pid) = pid {
                        send_signal(pid, Signal::SIGTERM);
                        let delay = timing.timeout_kill_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            send_signal(pid, Signal::SIGKILL);
                        });
                    }
                    return Err(Error::Timeout {
                        timeout: timing.command_timeout,
                        output,
                    });
                }
            }
        }

        if let Some(mut guard) = guard.take() {
            guard.check_and_restore().await;
            guard.disarm();
        }

        debug!(session = %key, code = ?exit_code, "client command exited");

        if message_sent && (stream_error || conflict) {
            // The reset arrived after delivery; the exit code is noise.
            return Ok(output);
        }
        if command.is_logout() && exit_code == Some(0) {
            if let Err(e) = self.store.delete(key).await {
                warn!(session = %key, error = %e, "failed to remove credential artifact");
            }
            self.registry.remove(key).await;
            info!(session = %key, "logged out, credentials removed");
            return Ok(output);
        }
        if exit_code == Some(0) {
            return Ok(output);
        }
        if message_sent {
            warn!(session = %key, code = ?exit_code, "abnormal exit after dispatch, tolerated");
            return Ok(output);
        }
        Err(Error::ProcessExit {
            code: exit_code,
            output,
        })
    }

    /// Put a lingering client process down without losing the credential
    /// artifact: SIGTERM, recheck, SIGKILL, final recheck.
    fn spawn_kill_sequence(&self, key: SessionKey, pid: Option<u32>, backup: Option<String>) {
        let Some(pid) = pid else { return };
        let store = self.store.clone();
        let timing = self.config.timing.clone();
        tokio::spawn(async move {
            debug!(session = %key, pid, "kill sequence started");
            send_signal(pid, Signal::SIGTERM);
            tokio::time::sleep(timing.term_to_kill_delay).await;
            if let Some(backup) = backup.as_deref() {
                guard::restore_if_invalid(&store, &key, backup).await;
            }
            send_signal(pid, Signal::SIGKILL);
            tokio::time::sleep(timing.post_kill_check_delay).await;
            if let Some(backup) = backup.as_deref() {
                guard::restore_if_invalid(&store, &key, backup).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("acme", 1).unwrap()
    }

    fn supervisor(base: &std::path::Path) -> Supervisor {
        Supervisor::new(EngineConfig::new(base))
    }

    #[test]
    fn test_command_args() {
        assert_eq!(ClientCommand::Logout.args(), vec![OsString::from("logout")]);
        let send = ClientCommand::Send {
            recipient: "1555".to_string(),
            message: "hi there".to_string(),
        };
        assert_eq!(
            send.args(),
            vec![
                OsString::from("send"),
                OsString::from("1555"),
                OsString::from("hi there")
            ]
        );
        let file = ClientCommand::SendFile {
            recipient: "1555".to_string(),
            path: PathBuf::from("/tmp/cat.jpg"),
            caption: Some("a cat".to_string()),
        };
        assert_eq!(
            file.args(),
            vec![
                OsString::from("send-file"),
                OsString::from("1555"),
                OsString::from("/tmp/cat.jpg"),
                OsString::from("--caption"),
                OsString::from("a cat")
            ]
        );
    }

    #[tokio::test]
    async fn test_gate_rejects_without_creds() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let err = sup.check_connected(&key()).await.unwrap_err();
        match err {
            Error::NotConnected { presence, state, .. } => {
                assert_eq!(presence, CredsPresence::Missing);
                assert!(state.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_gate_rejects_empty_creds() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.store.write(&key(), "  ").await.unwrap();
        let err = sup.check_connected(&key()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotConnected {
                presence: CredsPresence::Empty,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_gate_accepts_cached_creds() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.store.write(&key(), r#"{"noiseKey":"x"}"#).await.unwrap();
        sup.check_connected(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_rejects_error_record() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let shared = sup
            .registry
            .insert(key(), SessionRecord::new(4242))
            .await;
        shared.lock().await.state = SessionState::Error;
        let err = sup.check_connected(&key()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotConnected {
                state: Some(SessionState::Error),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_gate_prefers_valid_creds_over_stale_qr_record() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.store.write(&key(), r#"{"noiseKey":"x"}"#).await.unwrap();
        let shared = sup
            .registry
            .insert(key(), SessionRecord::new(4242))
            .await;
        shared.lock().await.state = SessionState::QrReady;
        sup.check_connected(&key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_login_reuses_running_process() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let shared = sup
            .registry
            .insert(key(), SessionRecord::new(4242))
            .await;
        {
            let mut rec = shared.lock().await;
            rec.state = SessionState::QrReady;
            rec.output.push_str("scan the code");
            rec.qr = Some(QrPayload::Url("https://wa.example/pair".to_string()));
        }

        let outcome = sup.login(&key()).await.unwrap();
        assert!(outcome.is_existing);
        assert_eq!(outcome.state, SessionState::QrReady);
        assert_eq!(
            outcome.qr,
            Some(QrPayload::Url("https://wa.example/pair".to_string()))
        );
    }
}
