//! External collaborators (spec §1, §6): named contracts for the pieces
//! this crate treats as boundaries rather than implementation — the
//! on-device metadata parser, the Markdown templating engine, the GUI
//! decision modals, and reading-statistics enrichment. A host application
//! supplies real implementations; this crate only defines the contract and
//! a couple of default, fully-functional pieces (`FileLogSink`,
//! `NullStatisticsEnricher`) that don't need a GUI or device driver behind
//! them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Annotation, BookMetadata};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("source file could not be read: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed source metadata: {0}")]
    Malformed(String),
}

/// What the on-device metadata parser hands back for one source file
/// (spec §6, "inbound source format").
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub metadata: BookMetadata,
    pub annotations: Vec<Annotation>,
}

/// Parses an e-reader's on-device metadata file into annotations and book
/// metadata. The on-device wire format itself is out of scope (spec §1);
/// this trait is only the seam a host driver plugs into.
#[async_trait]
pub trait SourceParser: Send + Sync {
    async fn parse(&self, source_path: &Path) -> Result<ParsedSource, ParseError>;
}

/// Renders a note body from a book's annotations, and names the file a
/// freshly-created note for that book should get. Out of scope per §1 —
/// the templating engine is a host concern.
pub trait TemplateRenderer: Send + Sync {
    fn render_body(&self, metadata: &BookMetadata, annotations: &[Annotation]) -> String;

    /// Desired on-disk filename stem (no extension) for `metadata`. Used by
    /// the Duplicate Finder's direct-probe step (spec §4.7) so a
    /// consistently-named vault never needs the degraded scan.
    fn filename_stem(&self, metadata: &BookMetadata) -> String;
}

/// A decision the host's GUI is asked to make when the pipeline can't
/// proceed unattended (spec §4.8 `AWAIT_USER_CHOICE` /
/// `AWAIT_STALE_LOCATION_CONFIRM`, spec §9 per-occurrence merge consent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    Proceed,
    Skip,
    AllowTwoWayMerge,
}

/// Asks the user a yes/no-shaped question mid-batch. Out of scope per §1 —
/// no GUI ships with this crate, only the contract a host modal
/// implements.
#[async_trait]
pub trait UserDecisionOracle: Send + Sync {
    /// The degraded duplicate scan timed out with no decisive match for
    /// `book_key`: proceed as a new note, or wait for the user to look?
    async fn ask_duplicate_timeout(&self, book_key: &str) -> UserDecision;

    /// A match for `book_key` was found outside the configured notes
    /// folder, at `found_at`.
    async fn ask_stale_location(&self, book_key: &str, found_at: &Path) -> UserDecision;

    /// No snapshot exists for this note's uid, so a three-way merge isn't
    /// possible; ask whether a two-way union merge may proceed instead.
    async fn ask_two_way_consent(&self, book_key: &str) -> UserDecision;

    /// A first pass over the batch produced only skips; ask whether to run
    /// a second pass with `forceReimport = true` (spec §4.10 "two-pass
    /// mode"). `Proceed` runs the second pass, anything else leaves the
    /// batch as-is.
    async fn ask_confirm_second_pass(&self, skipped_count: usize) -> UserDecision;
}

/// Supplies reading-statistics enrichment (pages read, percent complete,
/// and similar) beyond what the on-device source itself carries. A no-op
/// implementation is a legitimate production choice, so a default is
/// provided.
#[async_trait]
pub trait StatisticsEnricher: Send + Sync {
    async fn enrich(&self, metadata: &mut BookMetadata);
}

/// An enricher that leaves metadata untouched.
pub struct NullStatisticsEnricher;

#[async_trait]
impl StatisticsEnricher for NullStatisticsEnricher {
    async fn enrich(&self, _metadata: &mut BookMetadata) {}
}

/// Append-only best-effort log sink (spec §6, `log_<YYYY-MM-DD>.md`).
/// `tracing` already carries structured diagnostics, so no host
/// implementation is required to get a working importer — a default,
/// file-backed sink is provided below.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

/// Appends diagnostic lines to `<plugin_data_dir>/log_<YYYY-MM-DD>.md`,
/// rotating by calendar day. Failures to write are swallowed (this is a
/// best-effort human-readable trail, not the diagnostics system of
/// record) and surfaced only via `tracing::warn!`.
pub struct FileLogSink {
    plugin_data_dir: PathBuf,
}

impl FileLogSink {
    pub fn new(plugin_data_dir: PathBuf) -> Self {
        FileLogSink { plugin_data_dir }
    }

    fn path_for_today(&self) -> PathBuf {
        let today = chrono::Utc::now().format("%Y-%m-%d");
        self.plugin_data_dir.join(format!("log_{today}.md"))
    }
}

impl LogSink for FileLogSink {
    fn append(&self, line: &str) {
        use std::io::Write;
        let path = self.path_for_today();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = result {
            tracing::warn!(path = %path.display(), %err, "failed to append to log sink");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_enricher_is_a_no_op() {
        let mut metadata = BookMetadata {
            title: "Title".into(),
            authors: "Author".into(),
            md5: None,
            statistics: None,
        };
        NullStatisticsEnricher.enrich(&mut metadata).await;
        assert_eq!(metadata.title, "Title");
        assert!(metadata.statistics.is_none());
    }

    #[test]
    fn file_log_sink_appends_to_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileLogSink::new(dir.path().to_path_buf());
        sink.append("first line");
        sink.append("second line");
        let path = sink.path_for_today();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("first line"));
        assert!(content.contains("second line"));
    }
}
