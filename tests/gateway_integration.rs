//! Integration tests for Herald
//!
//! Drives a full session lifecycle through the orchestration engine the way
//! the HTTP handlers do: pair, poll status, send, log out. The messaging
//! client is a stub shell script that pairs instantly and writes its own
//! credential artifact, so the whole flow runs in milliseconds.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use herald_core::{
    ClientCommand, EngineConfig, SessionKey, SessionState, Supervisor, TimingConfig,
};

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("client.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn engine(base: &Path, script: &Path) -> EngineConfig {
    EngineConfig {
        client_bin: script.to_string_lossy().into_owned(),
        client_prefix_args: Vec::new(),
        base_dir: base.to_path_buf(),
        timing: TimingConfig {
            qr_wait_timeout: Duration::from_secs(5),
            qr_settle_delay: Duration::from_millis(50),
            command_timeout: Duration::from_secs(5),
            creds_poll_interval: Duration::from_millis(20),
            connected_detach_delay: Duration::from_millis(30),
            error_detach_delay: Duration::from_millis(30),
            ..TimingConfig::default()
        },
    }
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    // The stub handles every verb: login pairs instantly and writes the
    // credential artifact; send echoes the dispatch markers; logout exits
    // clean so the engine removes the artifact.
    let script = write_script(
        tmp.path(),
        r#"dir="$2"
if [ "$3" = "-v" ]; then verb="$4"; else verb="$3"; fi
case "$verb" in
  login)
    mkdir -p "$dir"
    printf '{"noiseKey":"abcdef0123456789"}' > "$dir/creds.json"
    echo "✔  Success   Logged in as +1555"
    exit 0
    ;;
  logout)
    echo "✔  Success   Logged out"
    exit 0
    ;;
  send)
    echo "Sending message: $6"
    echo "✔  Success   Done"
    exit 0
    ;;
  *)
    echo "✖  Error   unknown command" >&2
    exit 1
    ;;
esac"#,
    );
    let sup = Supervisor::new(engine(tmp.path(), &script));
    let key = SessionKey::new("acme", 7).unwrap();

    // Pair.
    let outcome = sup.login(&key).await.unwrap();
    assert_eq!(outcome.state, SessionState::Connected);
    assert!(!outcome.is_existing);

    // Status reflects the connected record.
    let status = sup.status(&key).await.unwrap().unwrap();
    assert_eq!(status.state, SessionState::Connected);

    // Send against the paired session.
    let output = sup
        .run_command(
            &key,
            ClientCommand::Send {
                recipient: "31612345678".to_string(),
                message: "hello".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(output.contains("Sending message"));
    assert!(sup.store().read(&key).await.unwrap().is_some());

    // Log out; the artifact and the record both go away.
    sup.run_command(&key, ClientCommand::Logout).await.unwrap();
    assert!(sup.store().read(&key).await.unwrap().is_none());
    assert!(sup.status(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sessions_are_isolated_per_tenant_and_branch() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "exit 0");
    let sup = Supervisor::new(engine(tmp.path(), &script));

    let a = SessionKey::new("acme", 1).unwrap();
    let b = SessionKey::new("acme", 2).unwrap();
    let c = SessionKey::new("globex", 1).unwrap();
    sup.store().write(&a, r#"{"noiseKey":"a"}"#).await.unwrap();

    assert!(sup.status(&a).await.unwrap().is_some());
    assert!(sup.status(&b).await.unwrap().is_none());
    assert!(sup.status(&c).await.unwrap().is_none());
    assert_ne!(sup.store().branch_dir(&a), sup.store().branch_dir(&b));
    assert_ne!(sup.store().branch_dir(&a), sup.store().branch_dir(&c));
}
