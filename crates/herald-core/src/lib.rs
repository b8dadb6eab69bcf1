//! Herald Core - Session Orchestration Engine
//!
//! This crate drives an external terminal messaging client on behalf of the
//! herald gateway, one isolated session per (tenant, branch):
//! - Supervisor: spawning, stream plumbing, timers, and signals
//! - Classify: inferring connection state from free-form client output
//! - Session: the registry of live and detached session records
//! - Creds: per-session credential artifact storage
//! - Guard: snapshot-and-restore protection for the credential artifact

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classify;
pub mod config;
pub mod creds;
pub mod error;
pub mod guard;
pub mod session;
pub mod supervisor;

pub use config::{EngineConfig, TimingConfig};
pub use creds::CredStore;
pub use error::{CredsPresence, Error, Result};
pub use session::{QrPayload, SessionKey, SessionRegistry, SessionState, StatusReport};
pub use supervisor::{ClientCommand, LoginOutcome, Supervisor};
