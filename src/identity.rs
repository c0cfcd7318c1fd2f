//! Identity Service (spec §4.3).
//!
//! Assigns and reads a note's stable `kohl-uid`. `assign_new_id` follows the
//! snapshot-first protocol: the new snapshot is written and durable *before*
//! the note itself is rewritten, so a crash at any point leaves either the
//! old (uid, snapshot, content) triple intact or the new one fully formed —
//! never a torn state (spec §8 invariant 1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::fs::{write_atomic, FsError, KeyedQueue};
use crate::frontmatter::{FrontmatterError, Note, KEY_PREV_UIDS, KEY_UID};
use crate::model::MAX_PREV_UIDS;
use crate::snapshot::{SnapshotError, SnapshotStore};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Frontmatter(#[from] FrontmatterError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Summary returned by [`IdentityService::resolve_in_folder`].
#[derive(Debug, Default, Clone)]
pub struct ResolveSummary {
    pub collisions: usize,
    pub files_reassigned: usize,
}

pub struct IdentityService {
    snapshots: SnapshotStore,
    /// Serializes UID changes per file — §4.3 "serialized per file".
    per_file: KeyedQueue<PathBuf>,
}

impl IdentityService {
    pub fn new(snapshots: SnapshotStore) -> Self {
        IdentityService {
            snapshots,
            per_file: KeyedQueue::new(),
        }
    }

    /// Read-only access to the backing snapshot store, used by the Planner
    /// to recompute `canMergeSafely` (spec §4.7: snapshot exists for the
    /// candidate's uid) and by the Executor to fetch the 3-way merge base.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Synchronous, no-I/O read of a UID already known to be embedded in
    /// `content` (the host's metadata cache equivalent — here, the content
    /// the caller already has in hand).
    pub fn try_get_id(content: &str) -> Option<String> {
        let note = Note::parse(content).ok()?;
        note.get_str(KEY_UID).map(|s| s.to_string())
    }

    /// Returns the existing UID, or assigns a new one via the snapshot-first
    /// protocol and returns the rewritten content alongside it.
    pub async fn ensure_id(
        &self,
        file: &Path,
        content: &str,
    ) -> Result<(String, Option<String>), IdentityError> {
        if let Some(uid) = Self::try_get_id(content) {
            return Ok((uid, None));
        }
        let (uid, new_content) = self.assign_new_id(file, content).await?;
        Ok((uid, Some(new_content)))
    }

    /// Snapshot-first UID assignment. Returns the new UID and the rewritten
    /// note content (the caller — typically the Executor — is responsible
    /// for treating this as the note's new canonical content).
    pub async fn assign_new_id(
        &self,
        file: &Path,
        content: &str,
    ) -> Result<(String, String), IdentityError> {
        let file = file.to_path_buf();
        let content = content.to_string();
        let snapshots = &self.snapshots;

        self.per_file
            .run(file.clone(), move || async move {
                Self::assign_new_id_locked(snapshots, &file, &content).await
            })
            .await
    }

    async fn assign_new_id_locked(
        snapshots: &SnapshotStore,
        file: &Path,
        content: &str,
    ) -> Result<(String, String), IdentityError> {
        // Step 1: patch the header with the new UID + bounded prev-uid list.
        let mut note = Note::parse(content)?;
        let old_uid = note.get_str(KEY_UID).map(|s| s.to_string());
        let new_uid = Uuid::new_v4().to_string();

        let mut prev_uids: Vec<String> = note
            .frontmatter
            .get(KEY_PREV_UIDS)
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(old) = &old_uid {
            prev_uids.push(old.clone());
            if prev_uids.len() > MAX_PREV_UIDS {
                let excess = prev_uids.len() - MAX_PREV_UIDS;
                prev_uids.drain(0..excess);
            }
        }

        note.set(
            KEY_UID,
            serde_yaml::Value::String(new_uid.clone()),
        );
        note.set(
            KEY_PREV_UIDS,
            serde_yaml::Value::Sequence(
                prev_uids.into_iter().map(serde_yaml::Value::String).collect(),
            ),
        );
        let patched_content = note.render()?;

        // Step 2 (Prepare): snapshot for the new UID must exist before the
        // note is committed. Abort entirely if this fails.
        snapshots
            .write_for_id(&new_uid, patched_content.as_bytes())
            .await?;

        // Step 3 (Commit): atomically rewrite the note.
        write_atomic(file, patched_content.as_bytes()).await?;

        // Step 4 (Cleanup): best-effort delete of the old snapshot, never
        // propagated as a failure.
        if let Some(old) = old_uid {
            if let Err(e) = snapshots.remove_for_id(&old).await {
                tracing::warn!(old_uid = %old, error = %e, "failed to clean up prior snapshot");
            }
        }

        Ok((new_uid, patched_content))
    }

    /// Scans `folder` for UID collisions across distinct files. For each
    /// collision, the oldest file (by mtime) keeps its UID; every other
    /// file is reassigned via [`Self::assign_new_id`].
    pub async fn resolve_in_folder(
        &self,
        folder: &Path,
    ) -> Result<ResolveSummary, IdentityError> {
        let mut by_uid: HashMap<String, Vec<(PathBuf, std::time::SystemTime)>> = HashMap::new();
        let mut entries = tokio::fs::read_dir(folder).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            if let Some(uid) = Self::try_get_id(&content) {
                let mtime = entry
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                by_uid.entry(uid).or_default().push((path, mtime));
            }
        }

        let mut summary = ResolveSummary::default();
        for (_uid, mut files) in by_uid {
            if files.len() < 2 {
                continue;
            }
            summary.collisions += 1;
            files.sort_by_key(|(_, mtime)| *mtime);
            // Oldest (first after sort) keeps the UID.
            for (path, _) in files.into_iter().skip(1) {
                let content = tokio::fs::read_to_string(&path).await?;
                self.assign_new_id(&path, &content).await?;
                summary.files_reassigned += 1;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn make_service(dir: &Path) -> IdentityService {
        IdentityService::new(SnapshotStore::new(dir.join("snapshots"), dir.join("backups")))
    }

    #[tokio::test]
    async fn try_get_id_absent_returns_none() {
        assert_eq!(IdentityService::try_get_id("no frontmatter here"), None);
    }

    #[tokio::test]
    async fn assign_new_id_writes_snapshot_before_note_is_observably_new() {
        let dir = tempdir().unwrap();
        let service = make_service(dir.path()).await;
        let file = dir.path().join("book.md");
        tokio::fs::write(&file, "---\ntitle: X\n---\nbody").await.unwrap();

        let (uid, _) = service
            .assign_new_id(&file, "---\ntitle: X\n---\nbody")
            .await
            .unwrap();

        let snapshot = service.snapshots.read_for_id(&uid).await.unwrap();
        assert!(snapshot.is_some());
        let note_content = tokio::fs::read_to_string(&file).await.unwrap();
        assert!(note_content.contains(&uid));
    }

    #[tokio::test]
    async fn assign_new_id_bounds_prev_uids() {
        let dir = tempdir().unwrap();
        let service = make_service(dir.path()).await;
        let file = dir.path().join("book.md");
        let mut content = "---\ntitle: X\n---\nbody".to_string();
        tokio::fs::write(&file, &content).await.unwrap();

        for _ in 0..8 {
            let (_uid, new_content) = service.assign_new_id(&file, &content).await.unwrap();
            content = new_content;
        }
        let note = Note::parse(&content).unwrap();
        let prev = note.frontmatter.get(KEY_PREV_UIDS).unwrap().as_sequence().unwrap();
        assert_eq!(prev.len(), MAX_PREV_UIDS);
    }

    #[tokio::test]
    async fn resolve_in_folder_keeps_oldest_reassigns_rest() {
        let dir = tempdir().unwrap();
        let notes_dir = dir.path().join("notes");
        tokio::fs::create_dir_all(&notes_dir).await.unwrap();
        let service = make_service(dir.path()).await;

        let shared_uid = Uuid::new_v4().to_string();
        let a = notes_dir.join("a.md");
        let b = notes_dir.join("b.md");
        tokio::fs::write(&a, format!("---\nkohl-uid: {shared_uid}\n---\nA")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tokio::fs::write(&b, format!("---\nkohl-uid: {shared_uid}\n---\nB")).await.unwrap();

        let summary = service.resolve_in_folder(&notes_dir).await.unwrap();
        assert_eq!(summary.collisions, 1);
        assert_eq!(summary.files_reassigned, 1);

        let a_content = tokio::fs::read_to_string(&a).await.unwrap();
        let b_content = tokio::fs::read_to_string(&b).await.unwrap();
        assert!(a_content.contains(&shared_uid));
        assert!(!b_content.contains(&format!("kohl-uid: {shared_uid}")));
    }
}
