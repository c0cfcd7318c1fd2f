//! Import pipeline core: content-addressed skip detection, duplicate
//! resolution, three-way merge, and crash-safe writes into a Markdown
//! vault of reading-highlight notes.
//!
//! This crate implements the pipeline's ten components (Atomic FS layer,
//! Snapshot Store, Identity Service, Local Index, Duplicate Finder,
//! Annotation Highlight Extractor, Merge Engine, Planner, Executor, Pipeline
//! Orchestrator) as a library; the on-device metadata parser, Markdown
//! templating engine, and GUI decision modals are host-supplied
//! implementations of the traits in [`external`].

pub mod config;
pub mod duplicate;
pub mod executor;
pub mod external;
pub mod frontmatter;
pub mod fs;
pub mod highlight;
pub mod identity;
pub mod index;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod snapshot;

use thiserror::Error;

/// Crate-level error aggregate for callers that don't need to match on a
/// specific component's error enum — the CLI boundary is the only place
/// this is actually used; every component internally keeps its own error
/// type.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Fs(#[from] fs::FsError),
    #[error(transparent)]
    Index(#[from] index::IndexError),
    #[error(transparent)]
    Identity(#[from] identity::IdentityError),
    #[error(transparent)]
    Snapshot(#[from] snapshot::SnapshotError),
    #[error(transparent)]
    Duplicate(#[from] duplicate::DuplicateError),
    #[error(transparent)]
    Highlight(#[from] highlight::HighlightError),
    #[error(transparent)]
    Merge(#[from] merge::MergeError),
    #[error(transparent)]
    Frontmatter(#[from] frontmatter::FrontmatterError),
    #[error(transparent)]
    Planner(#[from] planner::PlannerError),
    #[error(transparent)]
    Executor(#[from] executor::ExecutorError),
    #[error(transparent)]
    Parse(#[from] external::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
