//! Credential safety net.
//!
//! The client process sometimes truncates or deletes `creds.json` during a
//! transient stream error even though the logical operation (a message send)
//! succeeded. The guard snapshots the artifact before a risky command starts
//! and restores it whenever the on-disk copy goes missing, empty, or shrinks
//! below half the snapshot size. Logout commands never arm the guard: logout
//! is the one path that removes the artifact on purpose.
//!
//! Every restore is best effort. A failed restore is logged and swallowed;
//! it never fails the command it was protecting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::creds::CredStore;
use crate::session::SessionKey;

/// Snapshot-and-restore watcher for one command execution.
pub struct CredentialGuard {
    store: CredStore,
    key: SessionKey,
    backup: Arc<RwLock<Option<String>>>,
    monitor: Option<JoinHandle<()>>,
}

impl CredentialGuard {
    /// Snapshot the current artifact and start the self-healing poll.
    ///
    /// Absence of the artifact is not an error; a first-ever login has
    /// nothing to protect yet.
    pub async fn arm(store: CredStore, key: SessionKey, poll_interval: Duration) -> Self {
        let initial = match store.read(&key).await {
            Ok(Some(content)) if !content.trim().is_empty() => Some(content),
            Ok(_) => None,
            Err(e) => {
                debug!(session = %key, error = %e, "credential snapshot unavailable");
                None
            }
        };
        let backup = Arc::new(RwLock::new(initial));

        let monitor = {
            let store = store.clone();
            let key = key.clone();
            let backup = backup.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(poll_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // First tick fires immediately; skip it so the poll starts
                // one interval after arming.
                tick.tick().await;
                loop {
                    tick.tick().await;
                    let snapshot = backup.read().await.clone();
                    if let Some(snapshot) = snapshot.as_deref() {
                        restore_if_invalid(&store, &key, snapshot).await;
                    }
                }
            })
        };

        Self {
            store,
            key,
            backup,
            monitor: Some(monitor),
        }
    }

    /// Capture a snapshot now if none was taken at arm time. Used when the
    /// message-sent marker appears and the artifact has been written since
    /// the command started.
    pub async fn snapshot_if_missing(&self) {
        let mut backup = self.backup.write().await;
        if backup.is_none() {
            if let Ok(Some(content)) = self.store.read(&self.key).await {
                if !content.trim().is_empty() {
                    debug!(session = %self.key, "late credential snapshot taken");
                    *backup = Some(content);
                }
            }
        }
    }

    /// Replace the snapshot with the current on-disk artifact when the
    /// artifact is valid. Used right before a kill sequence.
    pub async fn refresh_snapshot(&self) {
        if let Ok(Some(content)) = self.store.read(&self.key).await {
            if !content.trim().is_empty() {
                *self.backup.write().await = Some(content);
            }
        }
    }

    /// Run one validity check, restoring from the snapshot if needed.
    pub async fn check_and_restore(&self) {
        let snapshot = self.backup.read().await.clone();
        if let Some(snapshot) = snapshot.as_deref() {
            restore_if_invalid(&self.store, &self.key, snapshot).await;
        }
    }

    /// Current snapshot content, if any.
    pub async fn backup(&self) -> Option<String> {
        self.backup.read().await.clone()
    }

    /// Stop the self-healing poll.
    pub fn disarm(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

impl Drop for CredentialGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Rewrite the credential artifact from `snapshot` when the on-disk copy is
/// missing, empty, or has shrunk below half the snapshot size.
pub(crate) async fn restore_if_invalid(store: &CredStore, key: &SessionKey, snapshot: &str) {
    if snapshot.trim().is_empty() {
        return;
    }
    let needs_restore = match store.read(key).await {
        Ok(Some(content)) => content.trim().is_empty() || content.len() < snapshot.len() / 2,
        Ok(None) => true,
        Err(e) => {
            debug!(session = %key, error = %e, "credential check failed");
            false
        }
    };
    if needs_restore {
        warn!(session = %key, "credential artifact lost or truncated, restoring from snapshot");
        if let Err(e) = store.write(key, snapshot).await {
            warn!(session = %key, error = %e, "credential restore failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("acme", 1).unwrap()
    }

    const CREDS: &str = r#"{"noiseKey":"abcdef","signedIdentityKey":"012345"}"#;

    #[tokio::test]
    async fn test_poll_restores_deleted_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        store.write(&key(), CREDS).await.unwrap();

        let mut guard =
            CredentialGuard::arm(store.clone(), key(), Duration::from_millis(20)).await;
        store.delete(&key()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.read(&key()).await.unwrap().unwrap(), CREDS);
        guard.disarm();
    }

    #[tokio::test]
    async fn test_poll_restores_truncated_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        store.write(&key(), CREDS).await.unwrap();

        let mut guard =
            CredentialGuard::arm(store.clone(), key(), Duration::from_millis(20)).await;
        // Shrunk below half of the snapshot size.
        store.write(&key(), "{}").await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.read(&key()).await.unwrap().unwrap(), CREDS);
        guard.disarm();
    }

    #[tokio::test]
    async fn test_no_restore_without_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());

        let mut guard =
            CredentialGuard::arm(store.clone(), key(), Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.read(&key()).await.unwrap().is_none());

        // A snapshot taken after the file appears starts protecting it.
        store.write(&key(), CREDS).await.unwrap();
        guard.snapshot_if_missing().await;
        store.delete(&key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.read(&key()).await.unwrap().unwrap(), CREDS);
        guard.disarm();
    }

    #[tokio::test]
    async fn test_healthy_file_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        store.write(&key(), CREDS).await.unwrap();

        let mut guard =
            CredentialGuard::arm(store.clone(), key(), Duration::from_millis(20)).await;
        // A rewrite of comparable size is the client's own update, not
        // corruption; it must survive the poll.
        let updated = format!("{CREDS} ");
        store.write(&key(), &updated).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.read(&key()).await.unwrap().unwrap(), updated);
        guard.disarm();
    }

    #[tokio::test]
    async fn test_explicit_check_and_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        store.write(&key(), CREDS).await.unwrap();

        let mut guard =
            CredentialGuard::arm(store.clone(), key(), Duration::from_secs(3600)).await;
        store.write(&key(), "").await.unwrap();
        guard.check_and_restore().await;
        assert_eq!(store.read(&key()).await.unwrap().unwrap(), CREDS);
        guard.disarm();
    }
}
