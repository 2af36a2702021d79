//! Run context: scratch directory and diagnostics
//!
//! One [`RunContext`] is created per run and passed through every stage. Its
//! scratch guard removes the run's working files on drop, so every exit path
//! (success, error, panic unwinding) cleans up.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-run scratch directory under the configured download directory
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
    path: PathBuf,
    cleanup: bool,
}

impl ScratchDir {
    /// Create `<root>/run-<run_id>`
    pub fn create(root: impl Into<PathBuf>, run_id: Uuid, cleanup: bool) -> Result<Self> {
        let root = root.into();
        let path = root.join(format!("run-{}", run_id.simple()));
        std::fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "Created scratch directory");
        Ok(Self {
            root,
            path,
            cleanup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path for a file inside the scratch directory
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Keep the directory after the run
    pub fn keep(&mut self) {
        self.cleanup = false;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.cleanup {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
        // Only succeeds when no other run or user file lives there
        let _ = std::fs::remove_dir(&self.root);
    }
}

/// Pipeline stage a diagnostic was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Reconcile,
    Join,
    Output,
}

/// Why rows were dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Field count differs from the header
    MalformedRow,
    /// Join key empty after normalization
    EmptyJoinKey,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::MalformedRow => write!(f, "malformed row"),
            DropReason::EmptyJoinKey => write!(f, "empty join key"),
        }
    }
}

/// A recoverable condition worth reporting at run end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    MissingColumn { column: String },
    RowsDropped { reason: DropReason, count: u64 },
    EmptyDataset,
    DuplicatePrimaryKeys { distinct_keys: u64, extra_rows: u64 },
    UnmatchedChildRows { count: u64 },
    RenamedOutputColumn { from: String, to: String },
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticKind::MissingColumn { column } => {
                write!(f, "expected column '{}' missing, rendered empty", column)
            },
            DiagnosticKind::RowsDropped { reason, count } => {
                write!(f, "{} row(s) dropped: {}", count, reason)
            },
            DiagnosticKind::EmptyDataset => write!(f, "dataset is empty"),
            DiagnosticKind::DuplicatePrimaryKeys {
                distinct_keys,
                extra_rows,
            } => write!(
                f,
                "{} join key(s) repeated in primary dataset ({} extra row(s))",
                distinct_keys, extra_rows
            ),
            DiagnosticKind::UnmatchedChildRows { count } => {
                write!(f, "{} row(s) without a matching primary key skipped", count)
            },
            DiagnosticKind::RenamedOutputColumn { from, to } => {
                write!(f, "output column '{}' renamed to '{}' to avoid a collision", from, to)
            },
        }
    }
}

/// One reported condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub stage: Stage,
    pub dataset: Option<String>,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.dataset {
            Some(dataset) => write!(f, "[{}] {}", dataset, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Accumulated diagnostics of one run
#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log a diagnostic
    pub fn record(&mut self, stage: Stage, dataset: Option<&str>, kind: DiagnosticKind) {
        warn!(stage = ?stage, dataset = dataset.unwrap_or("-"), "{}", kind);
        self.entries.push(Diagnostic {
            stage,
            dataset: dataset.map(str::to_string),
            kind,
        });
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State threaded through all stages of one run
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub scratch: ScratchDir,
    pub diagnostics: Diagnostics,
}

impl RunContext {
    /// Start a run with a fresh scratch directory under `scratch_root`
    pub fn start(scratch_root: impl Into<PathBuf>, cleanup: bool) -> Result<Self> {
        let run_id = Uuid::new_v4();
        let scratch = ScratchDir::create(scratch_root, run_id, cleanup)?;
        Ok(Self {
            run_id,
            started_at: Utc::now(),
            scratch,
            diagnostics: Diagnostics::new(),
        })
    }
}
