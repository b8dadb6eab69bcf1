//! Server configuration types
//!
//! Contains all configuration structures for the herald server. Engine
//! timings beyond the two user-facing timeouts stay at their built-in
//! defaults; they exist for tests, not deployments.

use std::path::PathBuf;
use std::time::Duration;

use herald_core::{EngineConfig, TimingConfig};
use serde::Deserialize;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub engine: EngineAppConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

/// API key authentication settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Require `X-API-Key` on every API request.
    #[serde(default)]
    pub enabled: bool,
    /// The accepted key. Required when `enabled` is true.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Engine configuration (exposed to TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineAppConfig {
    /// Executable that runs the messaging client.
    #[serde(default = "default_client_bin")]
    pub client_bin: String,
    /// Arguments inserted before the per-command arguments.
    #[serde(default = "default_client_args")]
    pub client_args: Vec<String>,
    /// Base directory for per-session state.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Overall wait for a login to produce a QR or a terminal state.
    #[serde(default = "default_qr_wait_timeout_secs")]
    pub qr_wait_timeout_secs: u64,
    /// Hard budget for non-login commands.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_client_bin() -> String {
    "npx".to_string()
}

fn default_client_args() -> Vec<String> {
    vec!["mudslide".to_string()]
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("data/sessions")
}

fn default_qr_wait_timeout_secs() -> u64 {
    300
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl EngineAppConfig {
    /// Build the engine configuration for the supervisor.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            client_bin: self.client_bin.clone(),
            client_prefix_args: self.client_args.clone(),
            base_dir: self.base_dir.clone(),
            timing: TimingConfig {
                qr_wait_timeout: Duration::from_secs(self.qr_wait_timeout_secs),
                command_timeout: Duration::from_secs(self.command_timeout_secs),
                ..TimingConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_carries_overrides() {
        let app = EngineAppConfig {
            client_bin: "mudslide".to_string(),
            client_args: vec![],
            base_dir: PathBuf::from("/var/lib/herald"),
            qr_wait_timeout_secs: 120,
            command_timeout_secs: 30,
        };
        let engine = app.engine_config();
        assert_eq!(engine.client_bin, "mudslide");
        assert_eq!(engine.timing.qr_wait_timeout, Duration::from_secs(120));
        assert_eq!(engine.timing.command_timeout, Duration::from_secs(30));
        // Internal timers keep their defaults.
        assert_eq!(
            engine.timing.creds_poll_interval,
            TimingConfig::default().creds_poll_interval
        );
    }
}
