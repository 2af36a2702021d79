//! Run summary
//!
//! Printed as text to stdout at the end of a successful run and optionally
//! written as JSON next to the output.

use crate::config::{DatasetRole, DatasetSpec};
use crate::context::{Diagnostic, DropReason};
use crate::error::Result;
use crate::output::OutputArtifact;
use crate::progress::format_bytes;
use crate::schema::{ReconciledDataset, Verdict};
use crate::source::RawDataset;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

/// Per-dataset figures
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub kind: String,
    pub role: DatasetRole,
    /// Multiplicity policy of a child
    pub policy: Option<String>,
    pub rows_fetched: Option<u64>,
    pub bytes_fetched: u64,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub dropped: BTreeMap<DropReason, u64>,
    pub verdict: Verdict,
    pub missing_columns: Vec<String>,
}

impl DatasetSummary {
    pub fn new(spec: &DatasetSpec, raw: &RawDataset, reconciled: &ReconciledDataset) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.source.as_str().to_string(),
            role: spec.role,
            policy: spec.multiplicity.as_ref().map(|p| p.to_string()),
            rows_fetched: raw.rows_fetched,
            bytes_fetched: raw.bytes,
            rows_read: reconciled.rows_read,
            rows_kept: reconciled.rows_kept,
            dropped: reconciled.dropped.clone(),
            verdict: reconciled.verdict.clone(),
            missing_columns: reconciled.missing_columns.clone(),
        }
    }
}

/// Everything reported about one successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetSummary>,
    pub primary_rows: u64,
    pub merged_rows: u64,
    pub output: OutputArtifact,
    pub warnings: Vec<Diagnostic>,
}

impl RunSummary {
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Human-readable report
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", "Merge complete".green().bold());
        let _ = writeln!(out, "  Run:      {}", self.run_id);
        let _ = writeln!(out, "  Duration: {:.1}s", self.duration_secs());
        let _ = writeln!(out);

        let _ = writeln!(out, "{}", "Datasets:".cyan().bold());
        for ds in &self.datasets {
            let policy = ds
                .policy
                .as_deref()
                .map(|p| format!(", {}", p))
                .unwrap_or_default();
            let _ = writeln!(out, "  {} ({}, {}{})", ds.name.bold(), ds.kind, ds.role, policy);
            let fetched = ds
                .rows_fetched
                .map(|r| format!("{} rows, ", r))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "    Fetched:  {}{}",
                fetched,
                format_bytes(ds.bytes_fetched)
            );
            let _ = writeln!(out, "    Rows:     {} read, {} kept", ds.rows_read, ds.rows_kept);
            for (reason, count) in &ds.dropped {
                let _ = writeln!(out, "    Dropped:  {} ({})", count, reason);
            }
            let _ = writeln!(out, "    Schema:   {}", ds.verdict);
            for coercion in ds.verdict.coercions() {
                let _ = writeln!(out, "              {}", coercion);
            }
        }
        let _ = writeln!(out);

        if !self.warnings.is_empty() {
            let _ = writeln!(
                out,
                "{}",
                format!("Warnings ({}):", self.warnings.len()).yellow().bold()
            );
            for warning in &self.warnings {
                let _ = writeln!(out, "  {}", warning);
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "{}", "Output:".cyan().bold());
        let _ = writeln!(out, "  Path:     {}", self.output.path.display());
        let _ = writeln!(
            out,
            "  Rows:     {} (from {} primary rows)",
            self.merged_rows, self.primary_rows
        );
        let _ = writeln!(out, "  Size:     {}", format_bytes(self.output.bytes));
        let _ = writeln!(out, "  SHA-256:  {}", self.output.sha256);
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}
