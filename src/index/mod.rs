//! Local Index (spec §4.2): a SQLite-backed cache of book identity, note
//! instances, and per-source change-detection state. Never authoritative —
//! the vault and the snapshot store are — so every query degrades to "don't
//! know, do the expensive thing" rather than erroring when the index is
//! unavailable.

mod migrations;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::fs::{Capability, CapabilityOracle};
use crate::model::SourceRecord;

pub use migrations::{MigrationError, CURRENT_SCHEMA_VERSION};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the index is currently backed. A host without a writable config
/// directory still gets a working (if non-durable) index rather than none
/// at all (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Persistent,
    InMemory,
    Unavailable,
}

pub struct LocalIndex {
    pool: Option<SqlitePool>,
    mode: IndexMode,
}

async fn open_pool(options: SqliteConnectOptions) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query(
                    "PRAGMA foreign_keys = ON; \
                     PRAGMA journal_mode = WAL; \
                     PRAGMA busy_timeout = 5000; \
                     PRAGMA synchronous = NORMAL; \
                     PRAGMA cache_size = -16384; \
                     PRAGMA temp_store = MEMORY;",
                )
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}

impl LocalIndex {
    /// Opens the index at `db_path`. Falls back to an in-memory database if
    /// the path can't be opened (read-only host, missing parent dir with no
    /// create permission), and to [`IndexMode::Unavailable`] only if even
    /// the in-memory fallback fails to initialize.
    pub async fn open(db_path: Option<&Path>) -> Self {
        if let Some(path) = db_path {
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
            let _ = tokio::fs::create_dir_all(&parent).await;

            let oracle = CapabilityOracle::new(parent.clone(), parent.clone());
            if !oracle.check(Capability::PersistentIndexLikely).await {
                tracing::warn!(path = %path.display(), "persistent index unlikely to succeed, falling back to in-memory");
                return Self::open_in_memory().await;
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            match open_pool(options).await {
                Ok(pool) => {
                    if migrations::migrate(&pool).await.is_ok() {
                        return LocalIndex {
                            pool: Some(pool),
                            mode: IndexMode::Persistent,
                        };
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "local index path unwritable, falling back to in-memory");
                }
            }
        }

        Self::open_in_memory().await
    }

    async fn open_in_memory() -> Self {
        match open_pool(SqliteConnectOptions::new().in_memory(true)).await {
            Ok(pool) if migrations::migrate(&pool).await.is_ok() => LocalIndex {
                pool: Some(pool),
                mode: IndexMode::InMemory,
            },
            _ => LocalIndex {
                pool: None,
                mode: IndexMode::Unavailable,
            },
        }
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    /// Vault paths of notes already materializing `book_key`, most useful
    /// when non-empty; an empty result means "none known", not "none
    /// exist" — callers fall back to the degraded scan.
    pub async fn find_existing_book_files(
        &self,
        book_key: &str,
    ) -> Result<Vec<PathBuf>, IndexError> {
        let Some(pool) = self.pool() else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query("SELECT vault_path FROM book_instances WHERE book_key = ?1")
            .bind(book_key)
            .fetch_all(pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| PathBuf::from(r.get::<String, _>("vault_path")))
            .collect())
    }

    /// Change-detection fast-skip (spec §4.2, §4.7 step "fast skip"): true
    /// if `mtime`/`size` match the last successfully processed state for
    /// `source_path`, meaning no new work is expected from this source.
    pub async fn should_process_source(
        &self,
        source_path: &Path,
        mtime: i64,
        size: u64,
    ) -> Result<bool, IndexError> {
        let Some(pool) = self.pool() else {
            return Ok(true); // unknown state: always reprocess
        };
        let row = sqlx::query(
            "SELECT last_processed_mtime, last_processed_size, last_error \
             FROM import_source WHERE source_path = ?1",
        )
        .bind(source_path.to_string_lossy().to_string())
        .fetch_optional(pool)
        .await?;
        match row {
            None => Ok(true),
            Some(r) => {
                let last_error: Option<String> = r.get("last_error");
                if last_error.is_some() {
                    return Ok(true); // previous attempt failed, always retry
                }
                let last_mtime: i64 = r.get("last_processed_mtime");
                let last_size: i64 = r.get("last_processed_size");
                Ok(last_mtime != mtime || last_size as u64 != size)
            }
        }
    }

    pub async fn record_import_success(
        &self,
        source_path: &Path,
        mtime: i64,
        size: u64,
        newest_annotation_ts: Option<&str>,
        book_key: Option<&str>,
        md5: Option<&str>,
    ) -> Result<(), IndexError> {
        let Some(pool) = self.pool() else { return Ok(()) };
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO import_source \
                 (source_path, last_processed_mtime, last_processed_size, \
                  newest_annotation_ts, last_success_ts, last_error, book_key, md5) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7) \
             ON CONFLICT(source_path) DO UPDATE SET \
                 last_processed_mtime = excluded.last_processed_mtime, \
                 last_processed_size = excluded.last_processed_size, \
                 newest_annotation_ts = excluded.newest_annotation_ts, \
                 last_success_ts = excluded.last_success_ts, \
                 last_error = NULL, \
                 book_key = excluded.book_key, \
                 md5 = excluded.md5",
        )
        .bind(source_path.to_string_lossy().to_string())
        .bind(mtime)
        .bind(size as i64)
        .bind(newest_annotation_ts)
        .bind(now)
        .bind(book_key)
        .bind(md5)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn record_import_failure(
        &self,
        source_path: &Path,
        error: &str,
    ) -> Result<(), IndexError> {
        let Some(pool) = self.pool() else { return Ok(()) };
        sqlx::query(
            "INSERT INTO import_source (source_path, last_processed_mtime, last_processed_size, last_error) \
             VALUES (?1, 0, 0, ?2) \
             ON CONFLICT(source_path) DO UPDATE SET last_error = excluded.last_error",
        )
        .bind(source_path.to_string_lossy().to_string())
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn clear_import_source(&self, source_path: &Path) -> Result<(), IndexError> {
        let Some(pool) = self.pool() else { return Ok(()) };
        sqlx::query("DELETE FROM import_source WHERE source_path = ?1")
            .bind(source_path.to_string_lossy().to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn get_source_record(
        &self,
        source_path: &Path,
    ) -> Result<Option<SourceRecord>, IndexError> {
        let Some(pool) = self.pool() else { return Ok(None) };
        let row = sqlx::query("SELECT * FROM import_source WHERE source_path = ?1")
            .bind(source_path.to_string_lossy().to_string())
            .fetch_optional(pool)
            .await?;
        Ok(row.map(|r| SourceRecord {
            source_path: source_path.to_path_buf(),
            last_processed_mtime: r.get("last_processed_mtime"),
            last_processed_size: r.get::<i64, _>("last_processed_size") as u64,
            newest_annotation_ts: r.get("newest_annotation_ts"),
            last_success_ts: r.get("last_success_ts"),
            last_error: r.get("last_error"),
            book_key: r.get("book_key"),
            md5: r.get("md5"),
        }))
    }

    /// Upserts the book row and links `vault_path` to it as an instance.
    pub async fn upsert_book(
        &self,
        book_key: &str,
        title: &str,
        authors: &str,
        vault_path: &Path,
    ) -> Result<(), IndexError> {
        let Some(pool) = self.pool() else { return Ok(()) };
        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO book (key, id, title, authors) VALUES (?1, NULL, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET title = excluded.title, authors = excluded.authors",
        )
        .bind(book_key)
        .bind(title)
        .bind(authors)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO book_instances (vault_path, book_key) VALUES (?1, ?2) \
             ON CONFLICT(vault_path) DO UPDATE SET book_key = excluded.book_key",
        )
        .bind(vault_path.to_string_lossy().to_string())
        .bind(book_key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Vault-event hook: a note moved. Orphan `book` rows are reclaimed by
    /// the `book_gc_after_instance_delete` trigger, not here.
    pub async fn on_note_renamed(&self, old_path: &Path, new_path: &Path) -> Result<(), IndexError> {
        let Some(pool) = self.pool() else { return Ok(()) };
        sqlx::query("UPDATE book_instances SET vault_path = ?1 WHERE vault_path = ?2")
            .bind(new_path.to_string_lossy().to_string())
            .bind(old_path.to_string_lossy().to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn on_note_deleted(&self, path: &Path) -> Result<(), IndexError> {
        let Some(pool) = self.pool() else { return Ok(()) };
        sqlx::query("DELETE FROM book_instances WHERE vault_path = ?1")
            .bind(path.to_string_lossy().to_string())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Re-derives the whole index from the vault's note frontmatter,
    /// discarding whatever was there before. Cancellable mid-scan via
    /// `token`; a cancelled rebuild leaves the prior index state untouched
    /// (runs inside its own transaction).
    pub async fn rebuild<F>(
        &self,
        notes_folder: &Path,
        token: &CancellationToken,
        mut on_progress: F,
    ) -> Result<usize, IndexError>
    where
        F: FnMut(usize),
    {
        let Some(pool) = self.pool() else { return Ok(0) };
        let mut entries = tokio::fs::read_dir(notes_folder).await?;
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                files.push(path);
            }
        }

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM book_instances").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM book").execute(&mut *tx).await?;

        let mut scanned = 0usize;
        for path in &files {
            if token.is_cancelled() {
                tx.rollback().await?;
                return Ok(scanned);
            }
            let content = match tokio::fs::read_to_string(path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let note = match crate::frontmatter::Note::parse(&content) {
                Ok(n) => n,
                Err(_) => continue,
            };
            let title = note.get_str("title").unwrap_or_default();
            let authors = note.get_str("authors").unwrap_or_default();
            if !title.is_empty() || !authors.is_empty() {
                let book_key = format!(
                    "{}::{}",
                    crate::model::normalize_key_part(authors),
                    crate::model::normalize_key_part(title)
                );
                sqlx::query(
                    "INSERT INTO book (key, id, title, authors) VALUES (?1, NULL, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET title = excluded.title, authors = excluded.authors",
                )
                .bind(&book_key)
                .bind(title)
                .bind(authors)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO book_instances (vault_path, book_key) VALUES (?1, ?2) \
                     ON CONFLICT(vault_path) DO UPDATE SET book_key = excluded.book_key",
                )
                .bind(path.to_string_lossy().to_string())
                .bind(&book_key)
                .execute(&mut *tx)
                .await?;
            }
            scanned += 1;
            on_progress(scanned);
        }
        tx.commit().await?;
        Ok(scanned)
    }

    /// Idle timeout used by callers deciding when a rebuild has stalled;
    /// not enforced internally since the scan itself is cancellable.
    pub const REBUILD_STALL_HINT: Duration = Duration::from_secs(30);

    /// Synchronous WAL checkpoint (spec §4.2 "on shutdown a synchronous
    /// flush runs to completion"). A no-op for an in-memory or unavailable
    /// index — there is nothing on disk to checkpoint.
    pub async fn flush(&self) -> Result<(), IndexError> {
        let Some(pool) = self.pool() else { return Ok(()) };
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_in_memory_when_no_path_given() {
        let index = LocalIndex::open(None).await;
        assert_eq!(index.mode(), IndexMode::InMemory);
    }

    #[tokio::test]
    async fn open_persistent_at_writable_path() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("sub").join("index.sqlite");
        let index = LocalIndex::open(Some(&db_path)).await;
        assert_eq!(index.mode(), IndexMode::Persistent);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn should_process_source_true_for_unknown_source() {
        let index = LocalIndex::open(None).await;
        let result = index
            .should_process_source(Path::new("/tmp/a.json"), 100, 10)
            .await
            .unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn should_process_source_false_after_matching_success_record() {
        let index = LocalIndex::open(None).await;
        let path = Path::new("/tmp/a.json");
        index
            .record_import_success(path, 100, 10, None, None, None)
            .await
            .unwrap();
        let result = index.should_process_source(path, 100, 10).await.unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn should_process_source_true_after_size_change() {
        let index = LocalIndex::open(None).await;
        let path = Path::new("/tmp/a.json");
        index
            .record_import_success(path, 100, 10, None, None, None)
            .await
            .unwrap();
        let result = index.should_process_source(path, 100, 99).await.unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn should_process_source_true_after_recorded_failure() {
        let index = LocalIndex::open(None).await;
        let path = Path::new("/tmp/a.json");
        index.record_import_failure(path, "boom").await.unwrap();
        let result = index.should_process_source(path, 100, 10).await.unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn upsert_book_and_find_existing_book_files() {
        let index = LocalIndex::open(None).await;
        index
            .upsert_book("king::it", "It", "King", Path::new("/vault/It.md"))
            .await
            .unwrap();
        let found = index.find_existing_book_files("king::it").await.unwrap();
        assert_eq!(found, vec![PathBuf::from("/vault/It.md")]);
    }

    #[tokio::test]
    async fn orphan_book_row_is_reclaimed_when_last_instance_removed() {
        let index = LocalIndex::open(None).await;
        index
            .upsert_book("king::it", "It", "King", Path::new("/vault/It.md"))
            .await
            .unwrap();
        index.on_note_deleted(Path::new("/vault/It.md")).await.unwrap();
        let pool = index.pool().unwrap();
        let row = sqlx::query("SELECT COUNT(*) as c FROM book WHERE key = 'king::it'")
            .fetch_one(pool)
            .await
            .unwrap();
        let count: i64 = row.get("c");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn on_note_renamed_updates_vault_path() {
        let index = LocalIndex::open(None).await;
        index
            .upsert_book("king::it", "It", "King", Path::new("/vault/It.md"))
            .await
            .unwrap();
        index
            .on_note_renamed(Path::new("/vault/It.md"), Path::new("/vault/It (renamed).md"))
            .await
            .unwrap();
        let found = index.find_existing_book_files("king::it").await.unwrap();
        assert_eq!(found, vec![PathBuf::from("/vault/It (renamed).md")]);
    }

    #[tokio::test]
    async fn rebuild_repopulates_from_vault_frontmatter() {
        let dir = tempdir().unwrap();
        let notes = dir.path().join("notes");
        tokio::fs::create_dir_all(&notes).await.unwrap();
        tokio::fs::write(
            notes.join("it.md"),
            "---\ntitle: It\nauthors: Stephen King\n---\nbody",
        )
        .await
        .unwrap();

        let index = LocalIndex::open(None).await;
        let token = CancellationToken::new();
        let scanned = index.rebuild(&notes, &token, |_| {}).await.unwrap();
        assert_eq!(scanned, 1);
        let found = index
            .find_existing_book_files("stephen king::it")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn rebuild_respects_cancellation() {
        let dir = tempdir().unwrap();
        let notes = dir.path().join("notes");
        tokio::fs::create_dir_all(&notes).await.unwrap();
        for i in 0..5 {
            tokio::fs::write(
                notes.join(format!("{i}.md")),
                format!("---\ntitle: Book {i}\nauthors: Author\n---\nbody"),
            )
            .await
            .unwrap();
        }

        let index = LocalIndex::open(None).await;
        let token = CancellationToken::new();
        token.cancel();
        let scanned = index.rebuild(&notes, &token, |_| {}).await.unwrap();
        assert_eq!(scanned, 0);
    }
}
