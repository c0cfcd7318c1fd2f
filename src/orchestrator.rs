//! Pipeline Orchestrator (spec §4.10): drives N source files with bounded
//! concurrency and cooperative cancellation, consulting the user oracle to
//! resolve `AWAIT_*` plans and two-way-merge consent, then handing every
//! resolved plan to the Executor. Per-source errors are captured into the
//! aggregate summary rather than aborting the batch (spec §7).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::executor::{ExecutionOutcome, Executor, ExecutorError};
use crate::external::{UserDecision, UserDecisionOracle};
use crate::identity::IdentityService;
use crate::index::LocalIndex;
use crate::model::SkipReason;
use crate::planner::{ImportPlan, Planner, PlannerError};

/// Default bounded-concurrency worker count (spec §4.10 "default ~6,
/// clamped by host parallelism").
pub const DEFAULT_CONCURRENCY: usize = 6;

pub fn default_concurrency() -> usize {
    let host = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    DEFAULT_CONCURRENCY.min(host.max(1))
}

/// Progress sink the orchestrator reports to: count done / total / current
/// status string (spec §4.10). Kept as a trait (not a concrete channel
/// type) so a host's own progress UI can be plugged in directly.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, done: usize, total: usize, current: &str);
}

/// A sink that does nothing; the default for headless/batch callers.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_progress(&self, _done: usize, _total: usize, _current: &str) {}
}

/// Per-source outcome (spec §7's per-item capture, before aggregation into
/// a [`BatchSummary`]).
#[derive(Debug, Clone)]
pub enum SourceOutcome {
    Skipped(SkipReason),
    Created(PathBuf),
    Merged { path: PathBuf, conflicts: bool },
    AutoMerged(PathBuf),
    Error(String),
    Cancelled,
}

/// Aggregate batch result (spec §7 "a batch ends with a summary
/// `{created, merged, automerged, skipped, errors}`"); `Serialize` so a
/// host can render it as JSON or feed it to telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub created: usize,
    pub merged: usize,
    pub automerged: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &SourceOutcome) {
        match outcome {
            SourceOutcome::Skipped(_) => self.skipped += 1,
            SourceOutcome::Created(_) => self.created += 1,
            SourceOutcome::Merged { .. } => self.merged += 1,
            SourceOutcome::AutoMerged(_) => self.automerged += 1,
            SourceOutcome::Error(_) => self.errors += 1,
            SourceOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// True iff every processed source was a skip — the two-pass mode's
    /// "nothing happened" trigger (spec §4.10).
    fn all_skipped(&self, total: usize) -> bool {
        total > 0 && self.skipped == total
    }
}

pub struct Orchestrator {
    planner: Arc<Planner>,
    executor: Arc<Executor>,
    identity: Arc<IdentityService>,
    index: Arc<LocalIndex>,
    oracle: Arc<dyn UserDecisionOracle>,
    concurrency: usize,
    backup_retention: Duration,
}

impl Orchestrator {
    pub fn new(
        planner: Arc<Planner>,
        executor: Arc<Executor>,
        identity: Arc<IdentityService>,
        index: Arc<LocalIndex>,
        oracle: Arc<dyn UserDecisionOracle>,
        concurrency: usize,
        backup_retention: Duration,
    ) -> Self {
        Orchestrator {
            planner,
            executor,
            identity,
            index,
            oracle,
            concurrency,
            backup_retention,
        }
    }

    /// Runs one pass over `sources`, then — if every source came back a
    /// skip and the batch wasn't forced or cancelled — consults the oracle
    /// about a second, `forceReimport = true` pass (spec §4.10 two-pass
    /// mode, for "the user changed the template" re-imports).
    pub async fn run_batch(
        &self,
        sources: &[PathBuf],
        force_reimport: bool,
        token: &CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> BatchSummary {
        let first = self
            .run_pass(sources, force_reimport, token, progress.clone())
            .await;

        if force_reimport || token.is_cancelled() || !first.all_skipped(sources.len()) {
            self.finish_batch().await;
            return first;
        }

        let decision = self.oracle.ask_confirm_second_pass(first.skipped).await;
        if decision != UserDecision::Proceed {
            self.finish_batch().await;
            return first;
        }

        let second = self.run_pass(sources, true, token, progress).await;
        self.finish_batch().await;
        second
    }

    async fn finish_batch(&self) {
        if let Err(e) = self.index.flush().await {
            tracing::warn!(error = %e, "failed to flush local index after batch");
        }
        match self
            .identity
            .snapshots()
            .prune_backups(self.backup_retention)
            .await
        {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "pruned expired backups");
                }
            }
            Err(e) => tracing::warn!(error = %e, "backup retention pass failed"),
        }
    }

    async fn run_pass(
        &self,
        sources: &[PathBuf],
        force_reimport: bool,
        token: &CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> BatchSummary {
        let total = sources.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let done = Arc::new(AtomicUsize::new(0));
        let mut set = JoinSet::new();

        for source in sources {
            let semaphore = semaphore.clone();
            let source = source.clone();
            let planner = self.planner.clone();
            let executor = self.executor.clone();
            let oracle = self.oracle.clone();
            let index = self.index.clone();
            let token = token.clone();
            let done = done.clone();
            let progress = progress.clone();

            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (source, SourceOutcome::Cancelled),
                };
                let outcome = if token.is_cancelled() {
                    SourceOutcome::Cancelled
                } else {
                    process_one(&planner, &executor, oracle.as_ref(), &index, &source, force_reimport, &token).await
                };
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress.on_progress(n, total, &source.display().to_string());
                (source, outcome)
            });
        }

        let mut summary = BatchSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((source, outcome)) => {
                    log_outcome(&source, &outcome);
                    summary.record(&outcome);
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "source-processing task panicked");
                    summary.errors += 1;
                }
            }
        }
        summary
    }
}

fn log_outcome(source: &Path, outcome: &SourceOutcome) {
    match outcome {
        SourceOutcome::Error(message) => {
            tracing::warn!(source = %source.display(), %message, "import failed");
        }
        SourceOutcome::Cancelled => {
            tracing::debug!(source = %source.display(), "import cancelled");
        }
        _ => {
            tracing::debug!(source = %source.display(), outcome = ?outcome, "import finished");
        }
    }
}

async fn process_one(
    planner: &Planner,
    executor: &Executor,
    oracle: &dyn UserDecisionOracle,
    index: &LocalIndex,
    source: &Path,
    force_reimport: bool,
    token: &CancellationToken,
) -> SourceOutcome {
    let stats = tokio::fs::metadata(source).await.ok();
    let (mtime, size) = match &stats {
        Some(m) => (mtime_secs(m), m.len()),
        None => (0, 0),
    };

    let plan_outcome = match planner.plan(source, force_reimport).await {
        Ok(outcome) => outcome,
        Err(err) => return record_failure(index, source, err).await,
    };
    for diagnostic in &plan_outcome.diagnostics {
        tracing::debug!(source = %source.display(), level = ?diagnostic.level, message = %diagnostic.message, "planner diagnostic");
    }

    let resolved = match resolve_awaits(planner, plan_outcome.plan, oracle).await {
        Ok(Some(plan)) => plan,
        Ok(None) => return SourceOutcome::Skipped(SkipReason::Unchanged),
        Err(err) => return record_failure(index, source, err).await,
    };

    if token.is_cancelled() {
        return SourceOutcome::Cancelled;
    }

    let mut two_way_consent = false;
    loop {
        match executor
            .execute(resolved.clone(), source, mtime, size, two_way_consent)
            .await
        {
            Ok(outcome) => return map_outcome(outcome),
            Err(ExecutorError::NeedsTwoWayConsent) if !two_way_consent => {
                let book_key = match &resolved {
                    ImportPlan::Merge { metadata, .. } => metadata.book_key(),
                    _ => String::new(),
                };
                if oracle.ask_two_way_consent(&book_key).await == UserDecision::AllowTwoWayMerge {
                    two_way_consent = true;
                    continue;
                }
                return SourceOutcome::Skipped(SkipReason::Unchanged);
            }
            Err(err) => return record_failure(index, source, err).await,
        }
    }
}

/// Resolves `AwaitUserChoice`/`AwaitStaleLocationConfirm` plans by
/// consulting the oracle (spec §4.8 step 4, §9 "keep [the user oracle] out
/// of the Planner"); every other plan passes through unchanged.
/// `Ok(None)` means the user chose to skip this source outright.
async fn resolve_awaits(
    planner: &Planner,
    plan: ImportPlan,
    oracle: &dyn UserDecisionOracle,
) -> Result<Option<ImportPlan>, PlannerError> {
    match plan {
        ImportPlan::AwaitUserChoice {
            book_key,
            candidate,
            metadata,
            annotations,
            newest_annotation_ts,
        } => {
            let decision = oracle.ask_duplicate_timeout(&book_key).await;
            if decision != UserDecision::Proceed {
                tracing::info!(book_key, "duplicate scan timed out, user chose to skip");
                return Ok(None);
            }
            Ok(Some(match candidate {
                Some(candidate) => {
                    let target = planner.build_merge_target(candidate).await?;
                    ImportPlan::Merge {
                        metadata,
                        annotations,
                        target,
                        newest_annotation_ts,
                    }
                }
                None => ImportPlan::Create {
                    metadata,
                    annotations,
                    newest_annotation_ts,
                },
            }))
        }
        ImportPlan::AwaitStaleLocationConfirm {
            book_key,
            candidate,
            metadata,
            annotations,
            newest_annotation_ts,
        } => {
            let decision = oracle.ask_stale_location(&book_key, &candidate.path).await;
            if decision != UserDecision::Proceed {
                return Ok(None);
            }
            let target = planner.build_merge_target(candidate).await?;
            Ok(Some(ImportPlan::Merge {
                metadata,
                annotations,
                target,
                newest_annotation_ts,
            }))
        }
        other => Ok(Some(other)),
    }
}

async fn record_failure(
    index: &LocalIndex,
    source: &Path,
    err: impl std::fmt::Display,
) -> SourceOutcome {
    let message = err.to_string();
    if let Err(e) = index.record_import_failure(source, &message).await {
        tracing::warn!(error = %e, "failed to record import failure in index");
    }
    SourceOutcome::Error(message)
}

fn map_outcome(outcome: ExecutionOutcome) -> SourceOutcome {
    match outcome {
        ExecutionOutcome::Skipped => SourceOutcome::Skipped(SkipReason::Unchanged),
        ExecutionOutcome::Created { path } => SourceOutcome::Created(path),
        ExecutionOutcome::Merged { path, conflicts } => SourceOutcome::Merged { path, conflicts },
        ExecutionOutcome::AutoMerged { path } => SourceOutcome::AutoMerged(path),
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplicate::DuplicateFinder;
    use crate::external::{NullStatisticsEnricher, ParseError, ParsedSource, SourceParser, TemplateRenderer};
    use crate::model::{Annotation, BookMetadata, ReadingStatistics};
    use crate::snapshot::SnapshotStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn annotation(id: &str, page: u32) -> Annotation {
        Annotation {
            id: id.to_string(),
            page,
            pos0: "p0".into(),
            pos1: "p1".into(),
            datetime: "2026-01-01T00:00:00Z".into(),
            text: format!("text-{id}"),
            note: None,
            chapter: None,
            color: None,
            drawer: None,
        }
    }

    struct StaticParser {
        annotations: Vec<Annotation>,
    }

    #[async_trait]
    impl SourceParser for StaticParser {
        async fn parse(&self, _source_path: &Path) -> Result<ParsedSource, ParseError> {
            Ok(ParsedSource {
                metadata: BookMetadata {
                    title: "A Title".to_string(),
                    authors: "Author".to_string(),
                    md5: None,
                    statistics: None::<ReadingStatistics>,
                },
                annotations: self.annotations.clone(),
            })
        }
    }

    struct JoinTemplate;
    impl TemplateRenderer for JoinTemplate {
        fn render_body(&self, _metadata: &BookMetadata, annotations: &[Annotation]) -> String {
            annotations
                .iter()
                .map(|a| crate::highlight::render_marker(a, crate::highlight::MarkerStyle::Html).unwrap())
                .collect::<Vec<_>>()
                .join("\n")
        }
        fn filename_stem(&self, metadata: &BookMetadata) -> String {
            metadata.title.clone()
        }
    }

    struct AlwaysProceed {
        second_pass_calls: StdMutex<usize>,
    }

    impl AlwaysProceed {
        fn new() -> Self {
            AlwaysProceed {
                second_pass_calls: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl UserDecisionOracle for AlwaysProceed {
        async fn ask_duplicate_timeout(&self, _book_key: &str) -> UserDecision {
            UserDecision::Proceed
        }
        async fn ask_stale_location(&self, _book_key: &str, _found_at: &Path) -> UserDecision {
            UserDecision::Proceed
        }
        async fn ask_two_way_consent(&self, _book_key: &str) -> UserDecision {
            UserDecision::AllowTwoWayMerge
        }
        async fn ask_confirm_second_pass(&self, _skipped_count: usize) -> UserDecision {
            *self.second_pass_calls.lock().unwrap() += 1;
            UserDecision::Skip
        }
    }

    async fn build_orchestrator(
        dir: &Path,
        annotations: Vec<Annotation>,
    ) -> (Orchestrator, Arc<LocalIndex>) {
        let index = Arc::new(LocalIndex::open(None).await);
        let snapshots = SnapshotStore::new(dir.join("snapshots"), dir.join("backups"));
        let identity = Arc::new(IdentityService::new(snapshots));
        let notes_folder = dir.join("notes");
        tokio::fs::create_dir_all(&notes_folder).await.unwrap();

        let finder = DuplicateFinder::new(notes_folder.clone());
        let parser = Arc::new(StaticParser { annotations });
        let template = Arc::new(JoinTemplate);
        let planner = Arc::new(Planner::new(
            index.clone(),
            identity.clone(),
            finder,
            parser,
            Arc::new(NullStatisticsEnricher),
            template.clone(),
            notes_folder.clone(),
        ));
        let executor = Arc::new(Executor::new(
            identity.clone(),
            index.clone(),
            template,
            notes_folder,
            vec![],
            true,
        ));
        let oracle: Arc<dyn UserDecisionOracle> = Arc::new(AlwaysProceed::new());
        let orchestrator = Orchestrator::new(
            planner,
            executor,
            identity,
            index.clone(),
            oracle,
            2,
            Duration::from_secs(30 * 24 * 60 * 60),
        );
        (orchestrator, index)
    }

    #[tokio::test]
    async fn first_import_creates_notes_for_every_source() {
        let dir = tempdir().unwrap();
        let (orchestrator, _index) =
            build_orchestrator(dir.path(), vec![annotation("a", 1)]).await;

        let mut sources = Vec::new();
        for i in 0..3 {
            let path = dir.path().join(format!("source-{i}.json"));
            tokio::fs::write(&path, "x").await.unwrap();
            sources.push(path);
        }

        let token = CancellationToken::new();
        let summary = orchestrator
            .run_batch(&sources, false, &token, Arc::new(NullProgressSink))
            .await;

        // Each source targets the same book key/title, so only the first
        // creates a new note; the rest automerge into it (no divergence).
        assert_eq!(summary.created + summary.automerged + summary.merged, 3);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn idempotent_rerun_reports_all_skipped() {
        let dir = tempdir().unwrap();
        let (orchestrator, _index) =
            build_orchestrator(dir.path(), vec![annotation("a", 1)]).await;

        let source = dir.path().join("source.json");
        tokio::fs::write(&source, "x").await.unwrap();
        let sources = vec![source];

        let token = CancellationToken::new();
        let first = orchestrator
            .run_batch(&sources, false, &token, Arc::new(NullProgressSink))
            .await;
        assert_eq!(first.created, 1);

        let second = orchestrator
            .run_batch(&sources, false, &token, Arc::new(NullProgressSink))
            .await;
        assert_eq!(second.skipped, 1);
        assert_eq!(second.created + second.merged + second.automerged, 0);
    }

    #[tokio::test]
    async fn cancellation_before_start_yields_cancelled_outcomes() {
        let dir = tempdir().unwrap();
        let (orchestrator, _index) =
            build_orchestrator(dir.path(), vec![annotation("a", 1)]).await;
        let source = dir.path().join("source.json");
        tokio::fs::write(&source, "x").await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let summary = orchestrator
            .run_batch(&[source], false, &token, Arc::new(NullProgressSink))
            .await;
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.created, 0);
    }
}
