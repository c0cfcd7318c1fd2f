//! Planner (spec §4.8): decides SKIP / CREATE / MERGE / `AWAIT_*` for one
//! source file. `Planner::plan` is the thin async harness that loads
//! whatever the decision needs from the Local Index, the external
//! `SourceParser`, and the Duplicate Finder; the decision itself never
//! performs a mutating write.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::duplicate::{DuplicateCandidate, DuplicateError, DuplicateFinder};
use crate::external::{ParseError, SourceParser, StatisticsEnricher, TemplateRenderer};
use crate::identity::{IdentityError, IdentityService};
use crate::index::{IndexError, LocalIndex};
use crate::model::{Annotation, BookMetadata, Diagnostic, SkipReason};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Duplicate(#[from] DuplicateError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A located duplicate, with the note-identity information the Executor
/// needs to find the right snapshot (spec §4.9 "acquire the snapshot for
/// `match.expectedUid`").
#[derive(Debug, Clone)]
pub struct MergeTarget {
    pub candidate: DuplicateCandidate,
    pub expected_uid: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ImportPlan {
    Skip {
        reason: SkipReason,
    },
    Create {
        metadata: BookMetadata,
        annotations: Vec<Annotation>,
        newest_annotation_ts: Option<String>,
    },
    Merge {
        metadata: BookMetadata,
        annotations: Vec<Annotation>,
        target: MergeTarget,
        newest_annotation_ts: Option<String>,
    },
    /// Degraded scan found nothing decisive; the orchestrator must consult
    /// the user oracle (spec §4.8 step 4, §8 scenario S5). Carries the
    /// already-parsed metadata/annotations so the orchestrator can resolve
    /// straight into `Create`/`Merge` without re-invoking the parser.
    AwaitUserChoice {
        book_key: String,
        candidate: Option<DuplicateCandidate>,
        metadata: BookMetadata,
        annotations: Vec<Annotation>,
        newest_annotation_ts: Option<String>,
    },
    /// A match exists, but outside the configured notes folder.
    AwaitStaleLocationConfirm {
        book_key: String,
        candidate: DuplicateCandidate,
        metadata: BookMetadata,
        annotations: Vec<Annotation>,
        newest_annotation_ts: Option<String>,
    },
}

pub struct PlanOutcome {
    pub plan: ImportPlan,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Planner {
    index: Arc<LocalIndex>,
    identity: Arc<IdentityService>,
    duplicate_finder: DuplicateFinder,
    parser: Arc<dyn SourceParser>,
    enricher: Arc<dyn StatisticsEnricher>,
    template: Arc<dyn TemplateRenderer>,
    notes_folder: PathBuf,
}

impl Planner {
    pub fn new(
        index: Arc<LocalIndex>,
        identity: Arc<IdentityService>,
        duplicate_finder: DuplicateFinder,
        parser: Arc<dyn SourceParser>,
        enricher: Arc<dyn StatisticsEnricher>,
        template: Arc<dyn TemplateRenderer>,
        notes_folder: PathBuf,
    ) -> Self {
        Planner {
            index,
            identity,
            duplicate_finder,
            parser,
            enricher,
            template,
            notes_folder,
        }
    }

    pub async fn plan(
        &self,
        source_path: &Path,
        force_reimport: bool,
    ) -> Result<PlanOutcome, PlannerError> {
        let mut diagnostics = Vec::new();

        // Step 1: stats. A missing stat is not fatal — we just can't use it
        // for the fast/final skip checks below.
        let stats = tokio::fs::metadata(source_path).await.ok();
        let (mtime, size) = match &stats {
            Some(m) => (mtime_secs(m), m.len()),
            None => {
                diagnostics.push(Diagnostic::warn(format!(
                    "could not stat {}",
                    source_path.display()
                )));
                (0, 0)
            }
        };

        // Step 2: fast skip.
        if !force_reimport && stats.is_some() {
            let should_process = self.index.should_process_source(source_path, mtime, size).await?;
            if !should_process {
                return Ok(PlanOutcome {
                    plan: ImportPlan::Skip {
                        reason: SkipReason::Unchanged,
                    },
                    diagnostics,
                });
            }
        }

        // Step 3: parse + enrich.
        let mut parsed = self.parser.parse(source_path).await?;
        if parsed.annotations.is_empty() {
            diagnostics.push(Diagnostic::info("source has no annotations"));
            return Ok(PlanOutcome {
                plan: ImportPlan::Skip {
                    reason: SkipReason::NoAnnotations,
                },
                diagnostics,
            });
        }
        self.enricher.enrich(&mut parsed.metadata).await;
        let newest_ts = newest_annotation_ts(&parsed.annotations);

        // Step 4: duplicate scan.
        let book_key = parsed.metadata.book_key();
        let stem = self.template.filename_stem(&parsed.metadata);
        let template_path = self.notes_folder.join(format!("{stem}.md"));
        let located = self
            .duplicate_finder
            .locate(&self.index, &book_key, &[template_path], &parsed.annotations)
            .await?;

        let unexpected_location = located
            .candidate
            .as_ref()
            .map(|c| !c.path.starts_with(&self.notes_folder))
            .unwrap_or(true);

        if located.scan_partial && unexpected_location {
            return Ok(PlanOutcome {
                plan: ImportPlan::AwaitUserChoice {
                    book_key,
                    candidate: located.candidate,
                    metadata: parsed.metadata,
                    annotations: parsed.annotations,
                    newest_annotation_ts: newest_ts,
                },
                diagnostics,
            });
        }

        if let Some(candidate) = &located.candidate {
            if !candidate.path.starts_with(&self.notes_folder) {
                return Ok(PlanOutcome {
                    plan: ImportPlan::AwaitStaleLocationConfirm {
                        book_key,
                        candidate: candidate.clone(),
                        metadata: parsed.metadata,
                        annotations: parsed.annotations,
                        newest_annotation_ts: newest_ts,
                    },
                    diagnostics,
                });
            }
        }

        // Step 5: final skip.
        if let Some(candidate) = &located.candidate {
            if !force_reimport {
                let prior = self.index.get_source_record(source_path).await?;
                let unchanged = prior.as_ref().is_some_and(|p| {
                    p.last_processed_mtime == mtime
                        && p.last_processed_size == size
                        && newest_ts.as_deref() <= p.newest_annotation_ts.as_deref()
                });
                if unchanged {
                    let mut target_paths = self.index.find_existing_book_files(&book_key).await?;
                    if target_paths.is_empty() {
                        target_paths.push(candidate.path.clone());
                    }
                    let mut all_exist = true;
                    for path in &target_paths {
                        if tokio::fs::metadata(path).await.is_err() {
                            all_exist = false;
                            break;
                        }
                    }
                    if all_exist {
                        return Ok(PlanOutcome {
                            plan: ImportPlan::Skip {
                                reason: SkipReason::Unchanged,
                            },
                            diagnostics,
                        });
                    }
                    diagnostics.push(Diagnostic::warn(format!(
                        "target instance for {book_key} missing on disk, recreating"
                    )));
                    return Ok(PlanOutcome {
                        plan: ImportPlan::Create {
                            metadata: parsed.metadata,
                            annotations: parsed.annotations,
                            newest_annotation_ts: newest_ts,
                        },
                        diagnostics,
                    });
                }
            }
        }

        // Step 6: merge or create.
        match located.candidate {
            None => Ok(PlanOutcome {
                plan: ImportPlan::Create {
                    metadata: parsed.metadata,
                    annotations: parsed.annotations,
                    newest_annotation_ts: newest_ts,
                },
                diagnostics,
            }),
            Some(candidate) => {
                let target = self.build_merge_target(candidate).await?;
                Ok(PlanOutcome {
                    plan: ImportPlan::Merge {
                        metadata: parsed.metadata,
                        annotations: parsed.annotations,
                        target,
                        newest_annotation_ts: newest_ts,
                    },
                    diagnostics,
                })
            }
        }
    }

    /// Resolves a located candidate into a [`MergeTarget`], reading its
    /// embedded uid and tightening `can_merge_safely` to require that a
    /// snapshot actually exists for it (spec §4.7's snapshot-backed
    /// `canMergeSafely`, sharpened beyond the content-only check the
    /// Duplicate Finder alone can make).
    ///
    /// Exposed so the Orchestrator can build the same target after a user
    /// decision resolves an `AWAIT_*` plan (spec §4.8 step 4) without
    /// duplicating this logic.
    pub async fn build_merge_target(
        &self,
        mut candidate: DuplicateCandidate,
    ) -> Result<MergeTarget, PlannerError> {
        let expected_uid = match tokio::fs::read_to_string(&candidate.path).await {
            Ok(content) => IdentityService::try_get_id(&content),
            Err(_) => None,
        };
        if let Some(uid) = &expected_uid {
            let snapshot_exists = self.identity.snapshots().read_for_id(uid).await?.is_some();
            candidate.can_merge_safely = candidate.can_merge_safely && snapshot_exists;
        } else {
            candidate.can_merge_safely = false;
        }
        Ok(MergeTarget {
            candidate,
            expected_uid,
        })
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Lexicographically greatest ISO-8601 datetime among `annotations` — safe
/// because ISO-8601 with a fixed-width, zero-padded format sorts the same
/// way textually as chronologically.
fn newest_annotation_ts(annotations: &[Annotation]) -> Option<String> {
    annotations.iter().map(|a| a.datetime.clone()).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::NullStatisticsEnricher;
    use crate::model::ReadingStatistics;
    use crate::snapshot::SnapshotStore;
    use async_trait::async_trait;
    use tempfile::tempdir;

    fn annotation(id: &str, page: u32, datetime: &str) -> Annotation {
        Annotation {
            id: id.to_string(),
            page,
            pos0: "p0".into(),
            pos1: "p1".into(),
            datetime: datetime.to_string(),
            text: format!("text-{id}"),
            note: None,
            chapter: None,
            color: None,
            drawer: None,
        }
    }

    struct StaticParser {
        metadata: BookMetadata,
        annotations: Vec<Annotation>,
    }

    #[async_trait]
    impl SourceParser for StaticParser {
        async fn parse(
            &self,
            _source_path: &Path,
        ) -> Result<crate::external::ParsedSource, ParseError> {
            Ok(crate::external::ParsedSource {
                metadata: self.metadata.clone(),
                annotations: self.annotations.clone(),
            })
        }
    }

    struct StemTemplate;
    impl TemplateRenderer for StemTemplate {
        fn render_body(&self, _metadata: &BookMetadata, _annotations: &[Annotation]) -> String {
            String::new()
        }
        fn filename_stem(&self, metadata: &BookMetadata) -> String {
            metadata.title.clone()
        }
    }

    fn sample_metadata(title: &str) -> BookMetadata {
        BookMetadata {
            title: title.to_string(),
            authors: "Author".to_string(),
            md5: None,
            statistics: None::<ReadingStatistics>,
        }
    }

    async fn build_planner(dir: &Path, annotations: Vec<Annotation>) -> (Planner, Arc<LocalIndex>) {
        let index = Arc::new(LocalIndex::open(None).await);
        let snapshots = SnapshotStore::new(dir.join("snapshots"), dir.join("backups"));
        let identity = Arc::new(IdentityService::new(snapshots));
        let notes_folder = dir.join("notes");
        tokio::fs::create_dir_all(&notes_folder).await.unwrap();
        let finder = DuplicateFinder::new(notes_folder.clone());
        let parser = Arc::new(StaticParser {
            metadata: sample_metadata("A Title"),
            annotations,
        });
        let planner = Planner::new(
            index.clone(),
            identity,
            finder,
            parser,
            Arc::new(NullStatisticsEnricher),
            Arc::new(StemTemplate),
            notes_folder,
        );
        (planner, index)
    }

    #[tokio::test]
    async fn no_annotations_produces_skip() {
        let dir = tempdir().unwrap();
        let (planner, _index) = build_planner(dir.path(), vec![]).await;
        let source = dir.path().join("source.json");
        tokio::fs::write(&source, "irrelevant").await.unwrap();
        let outcome = planner.plan(&source, false).await.unwrap();
        assert!(matches!(
            outcome.plan,
            ImportPlan::Skip {
                reason: SkipReason::NoAnnotations
            }
        ));
    }

    #[tokio::test]
    async fn no_existing_match_produces_create() {
        let dir = tempdir().unwrap();
        let annotations = vec![annotation("a", 1, "2026-01-01T00:00:00Z")];
        let (planner, _index) = build_planner(dir.path(), annotations).await;
        let source = dir.path().join("source.json");
        tokio::fs::write(&source, "irrelevant").await.unwrap();
        let outcome = planner.plan(&source, false).await.unwrap();
        assert!(matches!(outcome.plan, ImportPlan::Create { .. }));
    }

    #[tokio::test]
    async fn existing_match_produces_merge_with_expected_uid() {
        let dir = tempdir().unwrap();
        let annotations = vec![annotation("a", 1, "2026-01-01T00:00:00Z")];
        let (planner, _index) = build_planner(dir.path(), annotations.clone()).await;

        let note_path = dir.path().join("notes").join("A Title.md");
        let marker = crate::highlight::render_marker(&annotations[0], crate::highlight::MarkerStyle::Html).unwrap();
        tokio::fs::write(
            &note_path,
            format!("---\nkohl-uid: existing-uid\ntitle: A Title\n---\n{marker}\n"),
        )
        .await
        .unwrap();

        let source = dir.path().join("source.json");
        tokio::fs::write(&source, "irrelevant").await.unwrap();
        let outcome = planner.plan(&source, false).await.unwrap();
        match outcome.plan {
            ImportPlan::Merge { target, .. } => {
                assert_eq!(target.expected_uid.as_deref(), Some("existing-uid"));
                // No snapshot was ever written for "existing-uid", so a safe
                // automerge is not yet possible.
                assert!(!target.candidate.can_merge_safely);
            }
            other => panic!("expected Merge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fast_skip_when_source_unchanged() {
        let dir = tempdir().unwrap();
        let annotations = vec![annotation("a", 1, "2026-01-01T00:00:00Z")];
        let (planner, index) = build_planner(dir.path(), annotations).await;
        let source = dir.path().join("source.json");
        tokio::fs::write(&source, "irrelevant").await.unwrap();
        let meta = tokio::fs::metadata(&source).await.unwrap();
        index
            .record_import_success(&source, mtime_secs(&meta), meta.len(), None, None, None)
            .await
            .unwrap();
        let outcome = planner.plan(&source, false).await.unwrap();
        assert!(matches!(
            outcome.plan,
            ImportPlan::Skip {
                reason: SkipReason::Unchanged
            }
        ));
    }

    #[tokio::test]
    async fn force_reimport_bypasses_fast_skip() {
        let dir = tempdir().unwrap();
        let annotations = vec![annotation("a", 1, "2026-01-01T00:00:00Z")];
        let (planner, index) = build_planner(dir.path(), annotations).await;
        let source = dir.path().join("source.json");
        tokio::fs::write(&source, "irrelevant").await.unwrap();
        let meta = tokio::fs::metadata(&source).await.unwrap();
        index
            .record_import_success(&source, mtime_secs(&meta), meta.len(), None, None, None)
            .await
            .unwrap();
        let outcome = planner.plan(&source, true).await.unwrap();
        assert!(matches!(outcome.plan, ImportPlan::Create { .. }));
    }
}
