//! Core data model for the import pipeline (spec §3).
//!
//! These types are the shared vocabulary between every component: the
//! Planner reads them, the Executor writes them, the Local Index persists
//! a subset of them. None of the types here perform I/O.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single highlight extracted from the e-reader's on-device metadata, or
/// recovered from a note's embedded KOHL markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Stable fingerprint over `(page, pos0, pos1, normalize(text))` — see
    /// [`crate::highlight::annotation_id`].
    pub id: String,
    pub page: u32,
    pub pos0: String,
    pub pos1: String,
    /// ISO-8601, monotonic sortable within a book.
    pub datetime: String,
    pub text: String,
    pub note: Option<String>,
    pub chapter: Option<String>,
    pub color: Option<String>,
    pub drawer: Option<String>,
}

impl Annotation {
    /// `text` non-empty after trim is an invariant enforced at construction,
    /// not re-checked by every consumer.
    pub fn is_valid(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Per-source document properties parsed out of the device metadata file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub authors: String,
    /// Opaque content hash of the original book file, when the source
    /// format carries one.
    pub md5: Option<String>,
    pub statistics: Option<ReadingStatistics>,
}

impl BookMetadata {
    /// `normalize(authors) :: normalize(title)` — the conceptual book
    /// identity used to find existing notes across renames.
    pub fn book_key(&self) -> String {
        format!(
            "{}::{}",
            normalize_key_part(&self.authors),
            normalize_key_part(&self.title)
        )
    }
}

/// Lowercase, collapse whitespace, strip filesystem-unsafe characters.
pub fn normalize_key_part(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Optional per-book reading-statistics block. All fields follow the
/// `overwrite` frontmatter merge policy (§4.5 step 4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadingStatistics {
    pub pages: Option<u32>,
    pub last_read: Option<String>,
    pub first_read: Option<String>,
    pub progress: Option<f32>,
    pub reading_status: Option<String>,
    pub average_time_per_page: Option<f64>,
    pub total_read_time: Option<f64>,
}

/// Per-source-file processing state, persisted by the Local Index.
/// Primary key: `source_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_path: PathBuf,
    pub last_processed_mtime: i64,
    pub last_processed_size: u64,
    pub newest_annotation_ts: Option<String>,
    pub last_success_ts: Option<String>,
    pub last_error: Option<String>,
    pub book_key: Option<String>,
    pub md5: Option<String>,
}

/// Conceptual book identity. Garbage-collected when its last
/// [`BookInstance`] is removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub key: String,
    pub id: Option<String>,
    pub title: String,
    pub authors: String,
}

/// A physical note materializing a [`Book`]. `vault_path` is unique across
/// all instances — a note belongs to at most one book key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookInstance {
    pub book_key: String,
    pub vault_path: PathBuf,
}

/// A note's durable identity, embedded under the reserved `kohl-uid`
/// frontmatter key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteIdentity {
    pub uid: String,
    /// Bounded list of UIDs this note previously held (most recent last).
    pub prev_uids: Vec<String>,
}

/// Maximum length of [`NoteIdentity::prev_uids`] — oldest entries are
/// dropped once the bound is reached (spec §3).
pub const MAX_PREV_UIDS: usize = 5;

impl NoteIdentity {
    pub fn push_prev(&mut self, old_uid: String) {
        self.prev_uids.push(old_uid);
        if self.prev_uids.len() > MAX_PREV_UIDS {
            let excess = self.prev_uids.len() - MAX_PREV_UIDS;
            self.prev_uids.drain(0..excess);
        }
    }
}

/// How confidently a duplicate was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Found via direct filename probe or a warm index.
    Full,
    /// Found (or not found) via a time-bounded degraded scan.
    Partial,
}

/// Classification of a duplicate match against incoming annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    /// No new, no modified annotations.
    Exact,
    /// New annotations only; nothing modified.
    Updated,
    /// At least one existing annotation's content changed.
    Divergent,
}

/// Reason a source was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Unchanged,
    NoAnnotations,
}

/// A diagnostic emitted by a pure component (Planner, Merge Engine) that
/// bubbles up to logs without affecting control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

impl Diagnostic {
    pub fn info(message: impl Into<String>) -> Self {
        Diagnostic {
            level: DiagnosticLevel::Info,
            message: message.into(),
        }
    }
    pub fn warn(message: impl Into<String>) -> Self {
        Diagnostic {
            level: DiagnosticLevel::Warn,
            message: message.into(),
        }
    }
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            level: DiagnosticLevel::Error,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_key_normalizes_case_and_whitespace() {
        let a = BookMetadata {
            title: "  The   Long Walk ".into(),
            authors: "Stephen King".into(),
            md5: None,
            statistics: None,
        };
        let b = BookMetadata {
            title: "the long walk".into(),
            authors: "STEPHEN   KING".into(),
            md5: None,
            statistics: None,
        };
        assert_eq!(a.book_key(), b.book_key());
    }

    #[test]
    fn book_key_strips_unsafe_chars() {
        let m = BookMetadata {
            title: "Foo: Bar/Baz?".into(),
            authors: "A*B".into(),
            md5: None,
            statistics: None,
        };
        assert_eq!(m.book_key(), "ab::foo bar baz");
    }

    #[test]
    fn prev_uids_bounded() {
        let mut id = NoteIdentity {
            uid: "current".into(),
            prev_uids: Vec::new(),
        };
        for i in 0..10 {
            id.push_prev(format!("uid-{i}"));
        }
        assert_eq!(id.prev_uids.len(), MAX_PREV_UIDS);
        assert_eq!(id.prev_uids.last().unwrap(), "uid-9");
    }

    #[test]
    fn annotation_validity() {
        let mut a = Annotation {
            id: "x".into(),
            page: 1,
            pos0: "a".into(),
            pos1: "b".into(),
            datetime: "2026-01-01T00:00:00Z".into(),
            text: "  ".into(),
            note: None,
            chapter: None,
            color: None,
            drawer: None,
        };
        assert!(!a.is_valid());
        a.text = "  hello ".into();
        assert!(a.is_valid());
    }
}
