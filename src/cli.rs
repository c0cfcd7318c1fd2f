//! CLI harness for `kohl-import`: scaffolding around the library for
//! manual/integration testing, not part of the pipeline's own component
//! boundary. The on-device metadata parser, the templating engine, and the
//! decision oracle are host concerns in production; the implementations
//! below are working defaults good enough to drive the pipeline end to end
//! from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use kohl_import::config::Config;
use kohl_import::duplicate::DuplicateFinder;
use kohl_import::executor::Executor;
use kohl_import::external::{
    NullStatisticsEnricher, ParseError, ParsedSource, SourceParser, TemplateRenderer, UserDecision,
    UserDecisionOracle,
};
use kohl_import::highlight::{self, MarkerStyle};
use kohl_import::identity::IdentityService;
use kohl_import::index::LocalIndex;
use kohl_import::model::{Annotation, BookMetadata};
use kohl_import::orchestrator::{default_concurrency, Orchestrator, ProgressSink};
use kohl_import::planner::{ImportPlan, Planner};
use kohl_import::snapshot::SnapshotStore;

pub mod signal;

#[derive(Parser)]
#[command(name = "kohl-import")]
#[command(about = "Imports e-reader highlights into a Markdown vault")]
#[command(version)]
pub struct Cli {
    /// Vault root directory (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    pub vault: PathBuf,

    /// Enable debug-level logging regardless of RUST_LOG.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Imports every `*.json` source file in `dir` into the vault.
    Import {
        dir: PathBuf,
        /// Print the plan for each source without writing anything.
        #[arg(long)]
        dry_run: bool,
        /// Re-run every source regardless of the change-detection cache.
        #[arg(long)]
        force: bool,
    },
    /// Resolves duplicate `kohl-uid`s across notes in `dir`.
    ResolveUids { dir: PathBuf },
    /// Re-derives the local index from the vault's note frontmatter.
    RebuildIndex,
    /// Runs backup retention outside of a full import batch.
    Gc,
}

struct CliProgress {
    bar: indicatif::ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = indicatif::ProgressBar::new(total as u64);
        if let Ok(style) = indicatif::ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        CliProgress { bar }
    }
}

impl ProgressSink for CliProgress {
    fn on_progress(&self, done: usize, total: usize, current: &str) {
        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
        self.bar.set_message(current.to_string());
        if done >= total {
            self.bar.finish_and_clear();
        }
    }
}

/// Asks every mid-batch question on stdin/stderr. Good enough for a
/// one-shot CLI run; a GUI host implements the same trait with a modal.
struct StdinOracle;

fn prompt(question: &str) -> UserDecision {
    use std::io::Write;
    eprint!("{question}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return UserDecision::Skip;
    }
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => UserDecision::Proceed,
        _ => UserDecision::Skip,
    }
}

#[async_trait]
impl UserDecisionOracle for StdinOracle {
    async fn ask_duplicate_timeout(&self, book_key: &str) -> UserDecision {
        prompt(&format!(
            "duplicate scan for \"{book_key}\" timed out with no decisive match; proceed as a new note? [y/N] "
        ))
    }

    async fn ask_stale_location(&self, book_key: &str, found_at: &Path) -> UserDecision {
        prompt(&format!(
            "found a match for \"{book_key}\" outside the notes folder at {}; use it anyway? [y/N] ",
            found_at.display()
        ))
    }

    async fn ask_two_way_consent(&self, book_key: &str) -> UserDecision {
        match prompt(&format!(
            "no snapshot exists for \"{book_key}\"; allow a best-effort two-way merge? [y/N] "
        )) {
            UserDecision::Proceed => UserDecision::AllowTwoWayMerge,
            other => other,
        }
    }

    async fn ask_confirm_second_pass(&self, skipped_count: usize) -> UserDecision {
        prompt(&format!(
            "first pass skipped all {skipped_count} source(s); run a second pass with forced re-import? [y/N] "
        ))
    }
}

/// Minimal device-source wire format. The real on-device metadata parser is
/// a host concern; this is the schema that lets `import` be exercised
/// end-to-end without one.
#[derive(Debug, Deserialize)]
struct DeviceAnnotation {
    id: Option<String>,
    page: u32,
    pos0: String,
    pos1: String,
    datetime: String,
    text: String,
    note: Option<String>,
    chapter: Option<String>,
    color: Option<String>,
    drawer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceSource {
    title: String,
    authors: String,
    md5: Option<String>,
    annotations: Vec<DeviceAnnotation>,
}

struct JsonSourceParser;

#[async_trait]
impl SourceParser for JsonSourceParser {
    async fn parse(&self, source_path: &Path) -> Result<ParsedSource, ParseError> {
        let content = tokio::fs::read_to_string(source_path).await?;
        let source: DeviceSource =
            serde_json::from_str(&content).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let annotations = source
            .annotations
            .into_iter()
            .map(|a| {
                let id = a
                    .id
                    .unwrap_or_else(|| highlight::annotation_id(a.page, &a.pos0, &a.pos1, &a.text));
                Annotation {
                    id,
                    page: a.page,
                    pos0: a.pos0,
                    pos1: a.pos1,
                    datetime: a.datetime,
                    text: a.text,
                    note: a.note,
                    chapter: a.chapter,
                    color: a.color,
                    drawer: a.drawer,
                }
            })
            .collect();
        Ok(ParsedSource {
            metadata: BookMetadata {
                title: source.title,
                authors: source.authors,
                md5: source.md5,
                statistics: None,
            },
            annotations,
        })
    }
}

/// Joins every annotation's marker block into a note body, and names files
/// after the book's title. A host's real templating engine is out of scope;
/// this is a working default for manual testing.
struct DefaultTemplate {
    /// `None` means the configured style is `"none"` — render plain text
    /// with no embedded KOHL marker.
    style: Option<MarkerStyle>,
}

impl TemplateRenderer for DefaultTemplate {
    fn render_body(&self, _metadata: &BookMetadata, annotations: &[Annotation]) -> String {
        annotations
            .iter()
            .map(|a| match self.style {
                Some(style) => highlight::render_marker(a, style).ok().unwrap_or_default(),
                None => render_plain(a),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn filename_stem(&self, metadata: &BookMetadata) -> String {
        sanitize_filename(&metadata.title)
    }
}

/// Visible text + note, with no KOHL marker — used when the configured
/// comment style is `"none"`.
fn render_plain(a: &Annotation) -> String {
    let mut block = a.text.clone();
    if let Some(note) = &a.note {
        for line in note.lines() {
            block.push('\n');
            block.push_str("> ");
            block.push_str(line);
        }
    }
    block
}

fn sanitize_filename(s: &str) -> String {
    s.chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn index_db_path(vault: &Path) -> PathBuf {
    vault.join(".kohl-import").join("index.sqlite3")
}

fn snapshot_store(vault: &Path) -> SnapshotStore {
    let base = vault.join(".kohl-import");
    SnapshotStore::new(base.join("snapshots"), base.join("backups"))
}

async fn list_sources(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading source directory {}", dir.display()))?;
    let mut sources = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}

fn describe_plan(plan: &ImportPlan) -> &'static str {
    match plan {
        ImportPlan::Skip { .. } => "skip",
        ImportPlan::Create { .. } => "create",
        ImportPlan::Merge { .. } => "merge",
        ImportPlan::AwaitUserChoice { .. } => "await-user-choice",
        ImportPlan::AwaitStaleLocationConfirm { .. } => "await-stale-location-confirm",
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let vault = cli.vault;
    let config = Config::load(&vault);
    let notes_folder = config.notes_folder.clone().unwrap_or_else(|| vault.clone());
    tokio::fs::create_dir_all(&notes_folder).await.ok();

    match cli.command {
        Commands::Import { dir, dry_run, force } => {
            run_import(&vault, &notes_folder, &config, &dir, dry_run, force).await
        }
        Commands::ResolveUids { dir } => run_resolve_uids(&vault, &dir).await,
        Commands::RebuildIndex => run_rebuild_index(&vault, &notes_folder).await,
        Commands::Gc => run_gc(&vault, &config).await,
    }
}

async fn run_import(
    vault: &Path,
    notes_folder: &Path,
    config: &Config,
    dir: &Path,
    dry_run: bool,
    force: bool,
) -> Result<()> {
    let sources = list_sources(dir).await?;
    if sources.is_empty() {
        bail!("no *.json source files found in {}", dir.display());
    }

    let index = Arc::new(LocalIndex::open(Some(&index_db_path(vault))).await);
    let identity = Arc::new(IdentityService::new(snapshot_store(vault)));
    let template: Arc<dyn TemplateRenderer> = Arc::new(DefaultTemplate {
        style: config.comment_style_or_default(),
    });
    let parser: Arc<dyn SourceParser> = Arc::new(JsonSourceParser);
    let finder =
        DuplicateFinder::new(notes_folder.to_path_buf()).with_scan_timeout(config.scan_timeout());

    let planner = Arc::new(Planner::new(
        index.clone(),
        identity.clone(),
        finder,
        parser,
        Arc::new(NullStatisticsEnricher),
        template.clone(),
        notes_folder.to_path_buf(),
    ));

    if dry_run {
        for source in &sources {
            let outcome = planner.plan(source, force).await?;
            println!("{}: {}", source.display(), describe_plan(&outcome.plan));
        }
        return Ok(());
    }

    let executor = Arc::new(Executor::new(
        identity.clone(),
        index.clone(),
        template,
        notes_folder.to_path_buf(),
        config.disabled_fields.clone(),
        config.auto_merge_on_addition_or_default(),
    ));

    let token = CancellationToken::new();
    signal::setup_signal_handler(token.clone());

    let orchestrator = Orchestrator::new(
        planner,
        executor,
        identity,
        index,
        Arc::new(StdinOracle),
        default_concurrency(),
        config.backup_retention(),
    );

    let progress: Arc<dyn ProgressSink> = Arc::new(CliProgress::new(sources.len()));
    let summary = orchestrator.run_batch(&sources, force, &token, progress).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if signal::check_interrupted() {
        std::process::exit(signal::ExitCode::Interrupted as i32);
    }
    if summary.errors > 0 {
        std::process::exit(signal::ExitCode::CompletedWithErrors as i32);
    }
    Ok(())
}

async fn run_resolve_uids(vault: &Path, dir: &Path) -> Result<()> {
    let identity = IdentityService::new(snapshot_store(vault));
    let summary = identity.resolve_in_folder(dir).await?;
    println!(
        "resolved {} collision(s), reassigned {} file(s)",
        summary.collisions, summary.files_reassigned
    );
    Ok(())
}

async fn run_rebuild_index(vault: &Path, notes_folder: &Path) -> Result<()> {
    let index = LocalIndex::open(Some(&index_db_path(vault))).await;
    let token = CancellationToken::new();
    signal::setup_signal_handler(token.clone());
    let scanned = index
        .rebuild(notes_folder, &token, |n| {
            if n % 50 == 0 {
                eprintln!("rebuilt {n} notes so far...");
            }
        })
        .await?;
    index.flush().await?;
    println!("rebuilt index from {scanned} note(s)");
    Ok(())
}

async fn run_gc(vault: &Path, config: &Config) -> Result<()> {
    let identity = IdentityService::new(snapshot_store(vault));
    let removed = identity
        .snapshots()
        .prune_backups(config.backup_retention())
        .await?;
    println!("removed {removed} expired backup(s)");
    Ok(())
}
