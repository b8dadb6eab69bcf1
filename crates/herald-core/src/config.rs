//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the session orchestration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executable that runs the messaging client.
    pub client_bin: String,
    /// Arguments inserted before the per-command arguments
    /// (e.g. `["mudslide"]` when `client_bin` is `npx`).
    pub client_prefix_args: Vec<String>,
    /// Base directory holding one state directory per (tenant, branch).
    pub base_dir: PathBuf,
    /// Timer settings for supervision and the credential guard.
    pub timing: TimingConfig,
}

impl EngineConfig {
    /// Default engine configuration driving `mudslide` through `npx`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_bin: "npx".to_string(),
            client_prefix_args: vec!["mudslide".to_string()],
            base_dir: base_dir.into(),
            timing: TimingConfig::default(),
        }
    }
}

/// All supervision timers, tunable so tests can run the engine against
/// stub clients at millisecond scale.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Overall wait for a login to produce a QR or a terminal state.
    pub qr_wait_timeout: Duration,
    /// Window after first QR detection for late chunks to refine the payload.
    pub qr_settle_delay: Duration,
    /// Hard budget for non-login commands.
    pub command_timeout: Duration,
    /// Credential guard self-healing poll interval.
    pub creds_poll_interval: Duration,
    /// Delay before detaching the handle after a disconnect phrase.
    pub error_detach_delay: Duration,
    /// Delay before detaching the handle after a successful login.
    pub connected_detach_delay: Duration,
    /// Settle wait after a stream reset follows a message dispatch.
    pub stream_error_grace: Duration,
    /// Longer settle wait when a device conflict is also present. Applies
    /// both to the in-flight race timer and to the hard-timeout deferral
    /// (which historically settled for up to 20 s on conflict; one shared
    /// knob keeps the two paths consistent).
    pub conflict_grace: Duration,
    /// Delay between SIGTERM and SIGKILL in the conflict kill sequence.
    pub term_to_kill_delay: Duration,
    /// Delay between SIGTERM and SIGKILL on a plain timeout.
    pub timeout_kill_delay: Duration,
    /// Final credential check delay after a forceful kill.
    pub post_kill_check_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            qr_wait_timeout: Duration::from_secs(300),
            qr_settle_delay: Duration::from_secs(5),
            command_timeout: Duration::from_secs(60),
            creds_poll_interval: Duration::from_millis(500),
            error_detach_delay: Duration::from_secs(1),
            connected_detach_delay: Duration::from_secs(5),
            stream_error_grace: Duration::from_secs(10),
            conflict_grace: Duration::from_secs(15),
            term_to_kill_delay: Duration::from_secs(10),
            timeout_kill_delay: Duration::from_secs(3),
            post_kill_check_delay: Duration::from_secs(1),
        }
    }
}
