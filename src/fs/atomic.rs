//! Atomic FS layer (spec §4.1).
//!
//! Every mutating operation here writes to a sibling temp path, verifies the
//! write, then renames into place. Transient failures are retried inside
//! this layer; semantic failures are returned as a typed [`FsError`] and
//! never raised as a panic.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("write verification failed for {path}: readback did not match")]
    VerificationFailed { path: PathBuf },
}

impl FsError {
    fn from_io(path: &Path, err: std::io::Error, write: bool) -> Self {
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_path_buf()),
            ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_path_buf()),
            _ if write => FsError::WriteFailed {
                path: path.to_path_buf(),
                source: err,
            },
            _ => FsError::ReadFailed {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    /// Whether retrying the same operation might succeed (locked/busy/
    /// transient race during an existence check).
    fn is_transient(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut
        )
    }
}

/// Outcome of [`create_unique`] — success always returns a path; a
/// truncated-filename warning is non-fatal and surfaced for the caller to
/// log.
pub struct CreateUniqueResult {
    pub path: PathBuf,
    pub filename_truncated: bool,
}

/// Maximum filename length probed before truncating the stem (conservative
/// cross-host budget; most hosts allow 255 bytes per path component).
const MAX_FILENAME_BYTES: usize = 200;

fn tmp_sibling(path: &Path) -> PathBuf {
    let rand_suffix: u64 = rand::rng().random();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{rand_suffix:x}"));
    path.with_file_name(name)
}

/// Write `bytes` to `path` with write-temp-then-rename semantics, verifying
/// a byte-for-byte readback before returning success.
///
/// Falls back to a backup-swap sequence (rename existing to `.bak`, place
/// new file, verify, remove backup; restore backup on any failure) when the
/// host does not support rename-over-existing — see [`probe_rename_capability`].
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    let tmp = tmp_sibling(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| FsError::from_io(&tmp, e, true))?;

    let verify = tokio::fs::read(&tmp)
        .await
        .map_err(|e| FsError::from_io(&tmp, e, false))?;
    if verify != bytes {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(FsError::VerificationFailed {
            path: path.to_path_buf(),
        });
    }

    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) if rename_over_existing_unsupported(&e) => {
            let result = backup_swap(&tmp, path).await;
            if result.is_err() {
                let _ = tokio::fs::remove_file(&tmp).await;
            }
            result
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(FsError::from_io(path, e, true))
        }
    }
}

fn rename_over_existing_unsupported(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::AlreadyExists | ErrorKind::PermissionDenied
    )
}

/// Backup-swap fallback: rename the existing file to `path.bak`, place the
/// new file, verify, remove the backup — restoring it on any failure so the
/// note is never left missing.
async fn backup_swap(tmp: &Path, path: &Path) -> Result<(), FsError> {
    let bak = path.with_extension("bak");
    let had_existing = tokio::fs::metadata(path).await.is_ok();

    if had_existing {
        tokio::fs::rename(path, &bak)
            .await
            .map_err(|e| FsError::from_io(path, e, true))?;
    }

    if let Err(e) = tokio::fs::rename(tmp, path).await {
        if had_existing {
            let _ = tokio::fs::rename(&bak, path).await;
        }
        return Err(FsError::from_io(path, e, true));
    }

    match tokio::fs::metadata(path).await {
        Ok(_) => {
            if had_existing {
                let _ = tokio::fs::remove_file(&bak).await;
            }
            Ok(())
        }
        Err(e) => {
            if had_existing {
                let _ = tokio::fs::rename(&bak, path).await;
            }
            Err(FsError::from_io(path, e, false))
        }
    }
}

/// Capability probe: attempt `rename(a, b)` over an existing `b` in the
/// plugin data area. Run once at startup; the result feeds the Capability
/// Oracle (§4.11).
pub async fn probe_rename_capability(probe_dir: &Path) -> bool {
    let a = probe_dir.join(".kohl-rename-probe-a");
    let b = probe_dir.join(".kohl-rename-probe-b");
    if tokio::fs::write(&a, b"a").await.is_err() {
        return false;
    }
    if tokio::fs::write(&b, b"b").await.is_err() {
        let _ = tokio::fs::remove_file(&a).await;
        return false;
    }
    let ok = tokio::fs::rename(&a, &b).await.is_ok();
    let _ = tokio::fs::remove_file(&a).await;
    let _ = tokio::fs::remove_file(&b).await;
    ok
}

/// Read `path`, retrying on transient failures with exponential backoff and
/// jitter (max ~5 attempts).
pub async fn read_with_retry(path: &Path) -> Result<Vec<u8>, FsError> {
    let mut attempt = 0u32;
    loop {
        match tokio::fs::read(path).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if FsError::is_transient(&e) && attempt < 4 => {
                attempt += 1;
                let base_ms = 20u64 * (1 << attempt);
                let jitter_ms = rand::rng().random_range(0..base_ms / 2 + 1);
                tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
            }
            Err(e) => return Err(FsError::from_io(path, e, false)),
        }
    }
}

/// Idempotent directory creation. Distinguishes "already a folder" (ok)
/// from "exists as a file" (error) from "missing" (created recursively).
pub async fn ensure_folder(path: &Path) -> Result<(), FsError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(FsError::NotADirectory(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| FsError::from_io(path, e, true)),
        Err(e) => Err(FsError::from_io(path, e, false)),
    }
}

/// Generate a filename in `dir` guaranteed not to collide, consulting
/// `exists` for each candidate. Truncates an over-long stem and records the
/// truncation rather than failing.
pub async fn create_unique<F, Fut>(
    dir: &Path,
    stem: &str,
    ext: &str,
    content: &[u8],
    exists: F,
) -> Result<CreateUniqueResult, FsError>
where
    F: Fn(PathBuf) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    ensure_folder(dir).await?;

    let (stem, truncated) = truncate_to_budget(stem, ext);
    let mut candidate = dir.join(format!("{stem}.{ext}"));
    let mut n = 1u32;
    while exists(candidate.clone()).await {
        candidate = dir.join(format!("{stem} ({n}).{ext}"));
        n += 1;
    }

    write_atomic(&candidate, content).await?;

    Ok(CreateUniqueResult {
        path: candidate,
        filename_truncated: truncated,
    })
}

fn truncate_to_budget(stem: &str, ext: &str) -> (String, bool) {
    let budget = MAX_FILENAME_BYTES.saturating_sub(ext.len() + 1);
    if stem.len() <= budget {
        return (stem.to_string(), false);
    }
    let mut truncated = String::with_capacity(budget);
    for c in stem.chars() {
        if truncated.len() + c.len_utf8() > budget {
            break;
        }
        truncated.push(c);
    }
    (truncated, true)
}
