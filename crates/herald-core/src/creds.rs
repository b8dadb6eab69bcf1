//! Credential artifact storage.
//!
//! One directory per (tenant, branch) under a base path, containing the
//! `creds.json` proof-of-authentication file plus auxiliary state files
//! written by the client. All filesystem access for session state goes
//! through [`CredStore`]; the supervisor and guard never touch paths
//! directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::debug;

use crate::error::{CredsPresence, Error, Result};
use crate::session::SessionKey;

/// File holding the client's proof of authentication for one session.
pub const CREDS_FILE: &str = "creds.json";

/// Prefix of auxiliary state-sync files written by the client.
const STATE_KEY_PREFIX: &str = "app-state-sync-key-";

/// Directory listings can transiently fail while the client rewrites its
/// state files; retry a few times with a short backoff.
const READ_DIR_RETRIES: u32 = 3;
const READ_DIR_BACKOFF: Duration = Duration::from_millis(50);

/// Accessor for the per-session credential directory tree.
#[derive(Debug, Clone)]
pub struct CredStore {
    base_dir: PathBuf,
}

impl CredStore {
    /// Create a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory for one session's state.
    pub fn branch_dir(&self, key: &SessionKey) -> PathBuf {
        self.base_dir
            .join(&key.tenant)
            .join(key.branch_id.to_string())
    }

    /// Path of the credential artifact for one session.
    pub fn creds_path(&self, key: &SessionKey) -> PathBuf {
        self.branch_dir(key).join(CREDS_FILE)
    }

    /// Create the per-session directory if needed, returning its path.
    pub async fn ensure_branch_dir(&self, key: &SessionKey) -> Result<PathBuf> {
        let dir = self.branch_dir(key);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Read the credential artifact. A missing file is `None`, not an error.
    pub async fn read(&self, key: &SessionKey) -> Result<Option<String>> {
        match fs::read_to_string(self.creds_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the credential artifact.
    pub async fn write(&self, key: &SessionKey, content: &str) -> Result<()> {
        self.ensure_branch_dir(key).await?;
        fs::write(self.creds_path(key), content).await?;
        Ok(())
    }

    /// Delete the credential artifact. Idempotent; used only by logout.
    pub async fn delete(&self, key: &SessionKey) -> Result<()> {
        match fs::remove_file(self.creds_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Classify the credential artifact without exposing its content.
    pub async fn presence(&self, key: &SessionKey) -> Result<CredsPresence> {
        Ok(match self.read(key).await? {
            Some(content) if !content.trim().is_empty() => CredsPresence::Valid,
            Some(_) => CredsPresence::Empty,
            None => CredsPresence::Missing,
        })
    }

    /// Names of `app-state-sync-key-*.json` files in the session directory.
    pub async fn state_key_files(&self, key: &SessionKey) -> Result<Vec<String>> {
        let names = read_dir_with_retry(&self.branch_dir(key)).await?;
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with(STATE_KEY_PREFIX) && n.ends_with(".json"))
            .collect())
    }
}

/// List a directory's entry names, retrying with backoff on transient
/// failures. A missing directory yields an empty listing.
async fn read_dir_with_retry(dir: &Path) -> Result<Vec<String>> {
    let mut last_err = None;
    for attempt in 0..READ_DIR_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(READ_DIR_BACKOFF).await;
        }
        match fs::read_dir(dir).await {
            Ok(mut entries) => {
                let mut names = Vec::new();
                loop {
                    match entries.next_entry().await {
                        Ok(Some(entry)) => {
                            names.push(entry.file_name().to_string_lossy().into_owned());
                        }
                        Ok(None) => return Ok(names),
                        Err(e) => {
                            debug!(dir = %dir.display(), error = %e, "directory scan interrupted");
                            last_err = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "directory listing failed");
                last_err = Some(e);
            }
        }
    }
    Err(Error::Io(last_err.unwrap_or_else(|| {
        std::io::Error::other("directory listing failed")
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("acme", 1).unwrap()
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        assert!(store.read(&key()).await.unwrap().is_none());
        assert_eq!(store.presence(&key()).await.unwrap(), CredsPresence::Missing);
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        store.write(&key(), r#"{"me":{"id":"1555"}}"#).await.unwrap();
        let content = store.read(&key()).await.unwrap().unwrap();
        assert_eq!(content, r#"{"me":{"id":"1555"}}"#);
        assert_eq!(store.presence(&key()).await.unwrap(), CredsPresence::Valid);
    }

    #[tokio::test]
    async fn test_empty_content_is_not_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        store.write(&key(), "  \n").await.unwrap();
        assert_eq!(store.presence(&key()).await.unwrap(), CredsPresence::Empty);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        store.write(&key(), "x").await.unwrap();
        store.delete(&key()).await.unwrap();
        store.delete(&key()).await.unwrap();
        assert!(store.read(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_key_files_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        let dir = store.ensure_branch_dir(&key()).await.unwrap();
        fs::write(dir.join("app-state-sync-key-AA4AAKk2.json"), "{}")
            .await
            .unwrap();
        fs::write(dir.join("pre-key-1.json"), "{}").await.unwrap();
        let files = store.state_key_files(&key()).await.unwrap();
        assert_eq!(files, vec!["app-state-sync-key-AA4AAKk2.json".to_string()]);
    }

    #[tokio::test]
    async fn test_state_key_files_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredStore::new(tmp.path());
        assert!(store.state_key_files(&key()).await.unwrap().is_empty());
    }

    #[test]
    fn test_branch_dir_layout() {
        let store = CredStore::new("/var/lib/herald");
        let dir = store.branch_dir(&key());
        assert_eq!(dir, PathBuf::from("/var/lib/herald/acme/1"));
    }
}
