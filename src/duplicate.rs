//! Duplicate Finder (spec §4.6, §4.8, §9 degraded-scan behavior).
//!
//! Three escalating strategies to locate an existing note for the same
//! book, from cheapest to most expensive: a direct filename probe, an index
//! lookup, and — only when the index can't answer — a time-bounded
//! concurrent scan of the notes folder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;

use crate::highlight;
use crate::index::LocalIndex;
use crate::model::{Annotation, Confidence, MatchType};

#[derive(Debug, Error)]
pub enum DuplicateError {
    #[error(transparent)]
    Index(#[from] crate::index::IndexError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default wall-clock budget for the degraded scan (spec §9).
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub path: PathBuf,
    pub confidence: Confidence,
    pub match_type: MatchType,
    pub new_count: usize,
    pub modified_count: usize,
    pub can_merge_safely: bool,
}

/// Outcome of [`DuplicateFinder::locate`]. `scan_partial` is true only when
/// the degraded scan actually hit its wall-clock timeout (spec §4.8 step 4
/// "no decisive match" vs. a completed scan that genuinely found nothing) —
/// the Planner needs this distinction to choose between `AWAIT_USER_CHOICE`
/// and a plain `CREATE`.
#[derive(Debug, Clone, Default)]
pub struct LocateResult {
    pub candidate: Option<DuplicateCandidate>,
    pub scan_partial: bool,
}

pub struct DuplicateFinder {
    notes_folder: PathBuf,
    scan_timeout: Duration,
}

impl DuplicateFinder {
    pub fn new(notes_folder: PathBuf) -> Self {
        DuplicateFinder {
            notes_folder,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Locates the best existing note for `book_key`, or `None` if there is
    /// none. `template_paths` are filenames the naming convention would
    /// have produced for this book, checked first as a zero-I/O-cost probe.
    pub async fn locate(
        &self,
        index: &LocalIndex,
        book_key: &str,
        template_paths: &[PathBuf],
        incoming: &[Annotation],
    ) -> Result<LocateResult, DuplicateError> {
        // Direct probe.
        for candidate in template_paths {
            if tokio::fs::metadata(candidate).await.is_ok() {
                return Ok(LocateResult {
                    candidate: Some(self.analyze(candidate, Confidence::Full, incoming).await?),
                    scan_partial: false,
                });
            }
        }

        // Index path.
        let indexed = index.find_existing_book_files(book_key).await?;
        if !indexed.is_empty() {
            let mut candidates = Vec::new();
            for path in &indexed {
                if tokio::fs::metadata(path).await.is_ok() {
                    candidates.push(self.analyze(path, Confidence::Full, incoming).await?);
                }
            }
            if !candidates.is_empty() {
                return Ok(LocateResult {
                    candidate: Some(closest(candidates)),
                    scan_partial: false,
                });
            }
        }

        // Degraded path: index had nothing (or was unavailable/stale), fall
        // back to a time-bounded concurrent scan of the whole notes folder.
        self.degraded_scan(book_key, incoming).await
    }

    async fn degraded_scan(
        &self,
        book_key: &str,
        incoming: &[Annotation],
    ) -> Result<LocateResult, DuplicateError> {
        let scan = async {
            let mut entries = tokio::fs::read_dir(&self.notes_folder).await?;
            let mut paths = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("md") {
                    paths.push(path);
                }
            }

            let mut set = JoinSet::new();
            for path in paths {
                let book_key = book_key.to_string();
                set.spawn(async move { heuristic_match(&path, &book_key).await.then_some(path) });
            }
            let mut survivors = Vec::new();
            while let Some(res) = set.join_next().await {
                if let Ok(Some(path)) = res {
                    survivors.push(path);
                }
            }
            Ok::<_, DuplicateError>(survivors)
        };

        let survivors = match tokio::time::timeout(self.scan_timeout, scan).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(book_key, "degraded duplicate scan timed out, treating as not found");
                return Ok(LocateResult {
                    candidate: None,
                    scan_partial: true,
                });
            }
        };

        let mut candidates = Vec::new();
        for path in &survivors {
            candidates.push(self.analyze(path, Confidence::Partial, incoming).await?);
        }
        Ok(LocateResult {
            candidate: candidates.into_iter().reduce(|a, b| closest(vec![a, b])),
            scan_partial: false,
        })
    }

    async fn analyze(
        &self,
        path: &Path,
        confidence: Confidence,
        incoming: &[Annotation],
    ) -> Result<DuplicateCandidate, DuplicateError> {
        let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
        let existing = highlight::extract(&content).annotations;
        Ok(analyze_against(path.to_path_buf(), confidence, &existing, incoming))
    }
}

/// Cheap pre-filter for the degraded scan: does the filename or a quick
/// frontmatter read plausibly match `book_key`? Full extraction only runs on
/// survivors.
async fn heuristic_match(path: &Path, book_key: &str) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let normalized_stem = crate::model::normalize_key_part(stem);
    if book_key.contains(&normalized_stem) || normalized_stem.contains(book_key) {
        return true;
    }
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return false;
    };
    let Ok(note) = crate::frontmatter::Note::parse(&content) else {
        return false;
    };
    let title = note.get_str("title").unwrap_or_default();
    let authors = note.get_str("authors").unwrap_or_default();
    if title.is_empty() && authors.is_empty() {
        return false;
    }
    let key = format!(
        "{}::{}",
        crate::model::normalize_key_part(authors),
        crate::model::normalize_key_part(title)
    );
    key == book_key
}

/// Diffs `existing` against `incoming` by annotation id and classifies the
/// result (spec §4.6 "analyze candidate"). `can_merge_safely` here is a
/// content-only lower bound (no divergent edits); the Planner additionally
/// requires a snapshot to exist for the note's uid (spec §4.7) before an
/// automatic merge proceeds without user confirmation, and tightens this
/// field accordingly.
pub fn analyze_against(
    path: PathBuf,
    confidence: Confidence,
    existing: &[Annotation],
    incoming: &[Annotation],
) -> DuplicateCandidate {
    use std::collections::HashMap;
    let existing_by_id: HashMap<&str, &Annotation> =
        existing.iter().map(|a| (a.id.as_str(), a)).collect();

    let mut new_count = 0usize;
    let mut modified_count = 0usize;
    for incoming_annotation in incoming {
        match existing_by_id.get(incoming_annotation.id.as_str()) {
            None => new_count += 1,
            Some(existing_annotation) => {
                if existing_annotation.text != incoming_annotation.text
                    || existing_annotation.note != incoming_annotation.note
                {
                    modified_count += 1;
                }
            }
        }
    }

    let match_type = if modified_count > 0 {
        MatchType::Divergent
    } else if new_count > 0 {
        MatchType::Updated
    } else {
        MatchType::Exact
    };

    DuplicateCandidate {
        path,
        confidence,
        match_type,
        new_count,
        modified_count,
        can_merge_safely: modified_count == 0,
    }
}

/// Picks the candidate with the most matching (non-new, non-modified)
/// annotations — i.e. the closest match — breaking ties by preferring full
/// confidence, then by fewer divergences.
fn closest(mut candidates: Vec<DuplicateCandidate>) -> DuplicateCandidate {
    candidates.sort_by(|a, b| {
        let a_overlap = a.new_count + a.modified_count;
        let b_overlap = b.new_count + b.modified_count;
        a_overlap
            .cmp(&b_overlap)
            .then_with(|| match (a.confidence, b.confidence) {
                (Confidence::Full, Confidence::Partial) => std::cmp::Ordering::Less,
                (Confidence::Partial, Confidence::Full) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            })
    });
    candidates.into_iter().next().unwrap()
}
