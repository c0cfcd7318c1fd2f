//! Snapshot Store (spec §4.4) and backup retention (spec §4.5, §6).
//!
//! One file per live UID under the snapshot directory; one timestamped file
//! per pre-merge backup under the backup directory. Snapshots are never
//! time-pruned — only backups are.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;

use crate::fs::{write_atomic, Capability, CapabilityOracle, FsError, KeyedQueue};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// UTF-8 content snapshot store, keyed by note UID, plus the backup
/// directory used for pre-merge safety copies.
pub struct SnapshotStore {
    snapshot_dir: PathBuf,
    backup_dir: PathBuf,
    /// Per-UID serialization for snapshot writes (spec §5).
    per_uid: KeyedQueue<String>,
    /// Polled before every write; a host whose snapshot directory turns
    /// read-only mid-session degrades to "skip with a warning" rather than
    /// erroring out the whole import (spec §4.11).
    oracle: CapabilityOracle,
}

fn sanitize_basename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

impl SnapshotStore {
    pub fn new(snapshot_dir: PathBuf, backup_dir: PathBuf) -> Self {
        let oracle = CapabilityOracle::new(snapshot_dir.clone(), snapshot_dir.clone());
        SnapshotStore {
            snapshot_dir,
            backup_dir,
            per_uid: KeyedQueue::new(),
            oracle,
        }
    }

    fn path_for(&self, uid: &str) -> PathBuf {
        self.snapshot_dir.join(format!("{uid}.md"))
    }

    pub async fn write_for_id(&self, uid: &str, content: &[u8]) -> Result<(), SnapshotError> {
        if !self.oracle.check(Capability::SnapshotDirWritable).await {
            tracing::warn!(uid, "snapshot directory unavailable, skipping snapshot write");
            return Ok(());
        }
        let path = self.path_for(uid);
        let dir = self.snapshot_dir.clone();
        let content = content.to_vec();
        self.per_uid
            .run(uid.to_string(), move || async move {
                crate::fs::ensure_folder(&dir).await?;
                write_atomic(&path, &content).await?;
                Ok::<_, SnapshotError>(())
            })
            .await
    }

    /// Convenience used by the Executor to snapshot freshly created notes
    /// without reading them back from disk.
    pub async fn create_snapshot_from_content(
        &self,
        uid: &str,
        content: &str,
    ) -> Result<(), SnapshotError> {
        self.write_for_id(uid, content.as_bytes()).await
    }

    pub async fn read_for_id(&self, uid: &str) -> Result<Option<String>, SnapshotError> {
        let path = self.path_for(uid);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_for_id(&self, uid: &str) -> Result<(), SnapshotError> {
        let path = self.path_for(uid);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Takes a timestamped backup of `content` before a risky rewrite.
    /// Filename: `<safeBasename>-<shortHash>-<iso-timestamp>.md` (§6).
    pub async fn backup(&self, basename: &str, content: &str) -> Result<PathBuf, SnapshotError> {
        crate::fs::ensure_folder(&self.backup_dir).await?;
        let hash = blake3::hash(content.as_bytes()).to_hex();
        let short_hash = &hash.as_str()[..8];
        let ts = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let safe = sanitize_basename(basename);
        let filename = format!("{safe}-{short_hash}-{ts}.md");
        let path = self.backup_dir.join(filename);
        write_atomic(&path, content.as_bytes()).await?;
        Ok(path)
    }

    /// Prunes backups older than `retention` by wall-clock mtime.
    /// `retention <= 0 days` disables pruning entirely.
    pub async fn prune_backups(&self, retention: Duration) -> Result<usize, SnapshotError> {
        if retention.is_zero() {
            return Ok(0);
        }
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue, // best-effort: unreadable mtime is skipped, not fatal
            };
            let mtime = match meta.modified() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
            if age > retention {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> SnapshotStore {
        SnapshotStore::new(dir.join("snapshots"), dir.join("backups"))
    }

    #[tokio::test]
    async fn write_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.write_for_id("uid-1", b"hello").await.unwrap();
        assert_eq!(s.read_for_id("uid-1").await.unwrap(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn read_missing_returns_none() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        assert_eq!(s.read_for_id("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.write_for_id("uid-1", b"hello").await.unwrap();
        s.remove_for_id("uid-1").await.unwrap();
        s.remove_for_id("uid-1").await.unwrap();
        assert_eq!(s.read_for_id("uid-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn backup_filename_contains_hash_and_timestamp() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let path = s.backup("My Book.md", "content").await.unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("My Book.md-"));
        assert!(name.ends_with(".md"));
    }

    #[tokio::test]
    async fn prune_backups_zero_retention_disables_pruning() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.backup("a", "x").await.unwrap();
        let removed = s.prune_backups(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn prune_backups_removes_old_files() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let path = s.backup("a", "x").await.unwrap();
        // Backdate the file's mtime well past a 1ms retention window.
        let old = SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(old).unwrap();

        let removed = s.prune_backups(Duration::from_secs(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!path.exists());
    }
}
