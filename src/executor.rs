//! Executor (spec §4.9): realizes one Planner decision against the vault.
//!
//! SKIP only records the source outcome. CREATE renders a fresh note,
//! writes it via `create_unique`, then assigns it a UID through the
//! snapshot-first protocol. MERGE reconciles an existing note against the
//! freshly re-rendered device content, backing the note up first and
//! writing an updated snapshot after. Every byte that reaches disk goes
//! through the Atomic FS layer or a store built on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::Value;
use thiserror::Error;

use crate::external::TemplateRenderer;
use crate::frontmatter::{FrontmatterError, Note};
use crate::fs::{create_unique, FsError};
use crate::highlight;
use crate::identity::{IdentityError, IdentityService};
use crate::index::{IndexError, LocalIndex};
use crate::merge::{three_way_merge, two_way_union_merge_by_id, MergeError};
use crate::model::{Annotation, BookMetadata, MatchType};
use crate::planner::{ImportPlan, MergeTarget};
use crate::snapshot::SnapshotError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Frontmatter(#[from] FrontmatterError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no snapshot exists for this note's uid; a two-way merge needs explicit consent")]
    NeedsTwoWayConsent,
    #[error("plan requires orchestrator resolution (AWAIT_*) before it can be executed")]
    UnresolvedPlan,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Skipped,
    Created { path: PathBuf },
    Merged { path: PathBuf, conflicts: bool },
    AutoMerged { path: PathBuf },
}

pub struct Executor {
    identity: Arc<IdentityService>,
    index: Arc<LocalIndex>,
    template: Arc<dyn TemplateRenderer>,
    notes_folder: PathBuf,
    disabled_fields: Vec<String>,
    auto_merge_on_addition: bool,
}

impl Executor {
    pub fn new(
        identity: Arc<IdentityService>,
        index: Arc<LocalIndex>,
        template: Arc<dyn TemplateRenderer>,
        notes_folder: PathBuf,
        disabled_fields: Vec<String>,
        auto_merge_on_addition: bool,
    ) -> Self {
        Executor {
            identity,
            index,
            template,
            notes_folder,
            disabled_fields,
            auto_merge_on_addition,
        }
    }

    /// Realizes `plan`. `two_way_consent` reflects a prior
    /// `UserDecisionOracle::ask_two_way_consent` answer for this book and is
    /// only consulted when a MERGE has no common-ancestor snapshot.
    pub async fn execute(
        &self,
        plan: ImportPlan,
        source_path: &Path,
        mtime: i64,
        size: u64,
        two_way_consent: bool,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        match plan {
            ImportPlan::Skip { .. } => {
                self.index
                    .record_import_success(source_path, mtime, size, None, None, None)
                    .await?;
                Ok(ExecutionOutcome::Skipped)
            }
            ImportPlan::Create {
                metadata,
                annotations,
                newest_annotation_ts,
            } => {
                self.create(
                    source_path,
                    mtime,
                    size,
                    newest_annotation_ts.as_deref(),
                    &metadata,
                    &annotations,
                )
                .await
            }
            ImportPlan::Merge {
                metadata,
                annotations,
                target,
                newest_annotation_ts,
            } => {
                self.merge(
                    source_path,
                    mtime,
                    size,
                    newest_annotation_ts.as_deref(),
                    &metadata,
                    &annotations,
                    &target,
                    two_way_consent,
                )
                .await
            }
            ImportPlan::AwaitUserChoice { .. } | ImportPlan::AwaitStaleLocationConfirm { .. } => {
                Err(ExecutorError::UnresolvedPlan)
            }
        }
    }

    async fn create(
        &self,
        source_path: &Path,
        mtime: i64,
        size: u64,
        newest_annotation_ts: Option<&str>,
        metadata: &BookMetadata,
        annotations: &[Annotation],
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let body = self.template.render_body(metadata, annotations);
        let mut note = Note {
            frontmatter: Default::default(),
            body,
        };
        stamp_metadata_fields(&mut note, metadata);
        let content = note.render()?;

        let stem = self.template.filename_stem(metadata);
        let result = create_unique(&self.notes_folder, &stem, "md", content.as_bytes(), |p| {
            async move { tokio::fs::metadata(&p).await.is_ok() }
        })
        .await?;
        if result.filename_truncated {
            tracing::warn!(stem = %stem, "note filename truncated to fit the host's path length budget");
        }

        self.identity.ensure_id(&result.path, &content).await?;

        let book_key = metadata.book_key();
        self.index
            .upsert_book(&book_key, &metadata.title, &metadata.authors, &result.path)
            .await?;
        self.index
            .record_import_success(
                source_path,
                mtime,
                size,
                newest_annotation_ts,
                Some(&book_key),
                metadata.md5.as_deref(),
            )
            .await?;

        Ok(ExecutionOutcome::Created { path: result.path })
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge(
        &self,
        source_path: &Path,
        mtime: i64,
        size: u64,
        newest_annotation_ts: Option<&str>,
        metadata: &BookMetadata,
        annotations: &[Annotation],
        target: &MergeTarget,
        two_way_consent: bool,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let candidate = &target.candidate;
        let path = &candidate.path;
        let ours_content = tokio::fs::read_to_string(path).await?;

        let auto = self.auto_merge_on_addition
            && candidate.match_type == MatchType::Updated
            && candidate.modified_count == 0
            && candidate.can_merge_safely;

        let base = match &target.expected_uid {
            Some(uid) => self.identity.snapshots().read_for_id(uid).await?,
            None => None,
        };

        let body = self.template.render_body(metadata, annotations);
        let mut theirs_note = Note {
            frontmatter: Default::default(),
            body,
        };
        stamp_metadata_fields(&mut theirs_note, metadata);
        let theirs_content = theirs_note.render()?;

        let (merged_content, conflicts) = match &base {
            Some(base_content) => {
                let outcome =
                    three_way_merge(base_content, &ours_content, &theirs_content, &self.disabled_fields)?;
                (outcome.content, outcome.conflicts)
            }
            None => {
                if !two_way_consent {
                    return Err(ExecutorError::NeedsTwoWayConsent);
                }
                let ours_annotations = highlight::extract(&ours_content).annotations;
                let merged_annotations =
                    two_way_union_merge_by_id(&ours_annotations, annotations, true)
                        .unwrap_or_default();
                let merged_body = self.template.render_body(metadata, &merged_annotations);

                let mut ours_note = Note::parse(&ours_content)?;
                let theirs_note = Note::parse(&theirs_content)?;
                crate::frontmatter::merge_frontmatter(
                    &mut ours_note.frontmatter,
                    &theirs_note.frontmatter,
                    &self.disabled_fields,
                );
                ours_note.body = merged_body;
                (ours_note.render()?, false)
            }
        };

        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("note")
            .to_string();
        self.identity.snapshots().backup(&basename, &ours_content).await?;

        crate::fs::write_atomic(path, merged_content.as_bytes()).await?;

        match &target.expected_uid {
            Some(uid) => {
                self.identity
                    .snapshots()
                    .write_for_id(uid, merged_content.as_bytes())
                    .await?;
            }
            None => {
                self.identity.assign_new_id(path, &merged_content).await?;
            }
        }

        let book_key = metadata.book_key();
        self.index
            .upsert_book(&book_key, &metadata.title, &metadata.authors, path)
            .await?;
        self.index
            .record_import_success(
                source_path,
                mtime,
                size,
                newest_annotation_ts,
                Some(&book_key),
                metadata.md5.as_deref(),
            )
            .await?;

        if auto {
            Ok(ExecutionOutcome::AutoMerged { path: path.clone() })
        } else {
            Ok(ExecutionOutcome::Merged {
                path: path.clone(),
                conflicts,
            })
        }
    }
}

/// Writes `metadata`'s fields into `note.frontmatter` under the keys the
/// per-field merge policy table (spec §4.5 step 4) expects, so a freshly
/// created note and a freshly re-rendered "theirs" side agree on vocabulary
/// with an existing note during merge.
fn stamp_metadata_fields(note: &mut Note, metadata: &BookMetadata) {
    note.set("title", Value::String(metadata.title.clone()));
    note.set("authors", Value::String(metadata.authors.clone()));
    if let Some(stats) = &metadata.statistics {
        if let Some(v) = stats.pages {
            note.set("pages", Value::Number(v.into()));
        }
        if let Some(v) = &stats.last_read {
            note.set("lastRead", Value::String(v.clone()));
        }
        if let Some(v) = &stats.first_read {
            note.set("firstRead", Value::String(v.clone()));
        }
        if let Some(v) = stats.progress {
            note.set("progress", Value::Number((v as f64).into()));
        }
        if let Some(v) = &stats.reading_status {
            note.set("readingStatus", Value::String(v.clone()));
        }
        if let Some(v) = stats.average_time_per_page {
            note.set("averageTimePerPage", Value::Number(v.into()));
        }
        if let Some(v) = stats.total_read_time {
            note.set("totalReadTime", Value::Number(v.into()));
        }
    }
}
