//! Schema reconciliation
//!
//! Checks a materialized dataset's header against its expected columns and
//! rewrites it as a normalized comma-delimited file whose header is the
//! reconciled schema:
//!
//! 1. join key (only when not listed among the expected columns)
//! 2. expected columns, in configured order
//! 3. any extra observed columns, in observed order
//!
//! Columns are matched by exact name, then by configured alias, then
//! case-insensitively. A missing join key makes the dataset invalid; any other
//! missing column is rendered empty and reported.

use crate::config::{DatasetRole, DatasetSpec};
use crate::context::{DiagnosticKind, Diagnostics, DropReason, Stage};
use crate::error::{PipelineError, Result};
use crate::source::{PartFile, RawDataset};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

const UTF8_BOM: char = '\u{feff}';

/// A change applied to make a dataset fit its expected schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Coercion {
    /// Observed header mapped onto a canonical column name
    RenamedColumn { from: String, to: String },
    /// Join keys that had surrounding whitespace trimmed
    KeyNormalized { count: u64 },
}

impl std::fmt::Display for Coercion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Coercion::RenamedColumn { from, to } => write!(f, "column '{}' read as '{}'", from, to),
            Coercion::KeyNormalized { count } => write!(f, "{} join key(s) trimmed", count),
        }
    }
}

/// Outcome of reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "details", rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    ValidWithCoercions(Vec<Coercion>),
    Invalid(String),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Verdict::Invalid(_))
    }

    pub fn coercions(&self) -> &[Coercion] {
        match self {
            Verdict::ValidWithCoercions(coercions) => coercions,
            _ => &[],
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Valid => write!(f, "valid"),
            Verdict::ValidWithCoercions(c) => write!(f, "valid with {} coercion(s)", c.len()),
            Verdict::Invalid(reason) => write!(f, "invalid: {}", reason),
        }
    }
}

/// Fixed column layout of a reconciled dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schema {
    pub columns: Vec<String>,
    pub key_index: usize,
}

impl Schema {
    pub fn key(&self) -> &str {
        &self.columns[self.key_index]
    }

    /// Non-key columns with their indexes, in schema order
    pub fn value_columns(&self) -> impl Iterator<Item = (usize, &str)> {
        let key_index = self.key_index;
        self.columns
            .iter()
            .enumerate()
            .filter(move |(idx, _)| *idx != key_index)
            .map(|(idx, name)| (idx, name.as_str()))
    }
}

/// A dataset normalized against its expected schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledDataset {
    pub name: String,
    pub role: DatasetRole,
    /// Comma-delimited file with `schema.columns` as header
    pub path: PathBuf,
    pub schema: Schema,
    pub verdict: Verdict,
    pub missing_columns: Vec<String>,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub dropped: BTreeMap<DropReason, u64>,
}

impl ReconciledDataset {
    /// Turn an invalid verdict into a schema violation
    pub fn into_valid(self) -> Result<Self> {
        if let Verdict::Invalid(reason) = &self.verdict {
            return Err(PipelineError::schema_violation(&self.name, reason.clone()));
        }
        Ok(self)
    }

    pub fn rows_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }
}

/// Where each schema column is read from in the observed header
#[derive(Debug)]
struct ColumnMapping {
    schema: Schema,
    /// Observed index per schema column; `None` renders empty
    sources: Vec<Option<usize>>,
    renamed: Vec<Coercion>,
    missing: Vec<String>,
}

/// Reconcile one raw dataset and write its normalized file to `target`
#[instrument(skip_all, fields(dataset = %spec.name))]
pub fn reconcile(
    raw: &RawDataset,
    spec: &DatasetSpec,
    join_key: &str,
    target: &Path,
    diagnostics: &mut Diagnostics,
) -> Result<ReconciledDataset> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(raw.delimiter)
        .has_headers(false)
        .flexible(true)
        .from_path(&raw.path)?;

    let mut header = csv::StringRecord::new();
    let has_header = reader.read_record(&mut header)?;

    let expected = expected_columns(join_key, &spec.columns);
    let mapping = if has_header {
        let observed = clean_header(&header);
        match map_columns(&observed, &expected, join_key, &spec.aliases) {
            Some(mapping) => mapping,
            None => {
                let reason = format!(
                    "join key '{}' not found in header [{}]",
                    join_key,
                    observed.join(", ")
                );
                return Ok(ReconciledDataset {
                    name: spec.name.clone(),
                    role: spec.role,
                    path: target.to_path_buf(),
                    schema: Schema {
                        columns: expected,
                        key_index: 0,
                    },
                    verdict: Verdict::Invalid(reason),
                    missing_columns: vec![join_key.to_string()],
                    rows_read: 0,
                    rows_kept: 0,
                    dropped: BTreeMap::new(),
                });
            },
        }
    } else {
        ColumnMapping {
            sources: vec![None; expected.len()],
            schema: Schema {
                columns: expected,
                key_index: 0,
            },
            renamed: Vec::new(),
            missing: Vec::new(),
        }
    };

    for column in &mapping.missing {
        diagnostics.record(
            Stage::Reconcile,
            Some(&spec.name),
            DiagnosticKind::MissingColumn {
                column: column.clone(),
            },
        );
    }

    let part = PartFile::new(target.with_extension("csv.part"));
    let mut writer = csv::Writer::from_path(part.path())?;
    writer.write_record(&mapping.schema.columns)?;

    let key_source = mapping.sources[mapping.schema.key_index];
    let mut rows_read = 0u64;
    let mut rows_kept = 0u64;
    let mut keys_trimmed = 0u64;
    let mut dropped: BTreeMap<DropReason, u64> = BTreeMap::new();
    let mut record = csv::StringRecord::new();

    if has_header {
        loop {
            match reader.read_record(&mut record) {
                Ok(true) => {},
                Ok(false) => break,
                Err(e) if matches!(e.kind(), csv::ErrorKind::Utf8 { .. }) => {
                    rows_read += 1;
                    *dropped.entry(DropReason::MalformedRow).or_default() += 1;
                    continue;
                },
                Err(e) => return Err(e.into()),
            }
            rows_read += 1;

            if record.len() != header.len() {
                *dropped.entry(DropReason::MalformedRow).or_default() += 1;
                continue;
            }

            let raw_key = key_source.and_then(|idx| record.get(idx)).unwrap_or("");
            let key = raw_key.trim();
            if key.is_empty() {
                *dropped.entry(DropReason::EmptyJoinKey).or_default() += 1;
                continue;
            }
            if key.len() != raw_key.len() {
                keys_trimmed += 1;
            }

            let key_index = mapping.schema.key_index;
            writer.write_record(mapping.sources.iter().enumerate().map(|(idx, source)| {
                if idx == key_index {
                    key
                } else {
                    source.and_then(|s| record.get(s)).unwrap_or("")
                }
            }))?;
            rows_kept += 1;
        }
    }

    writer.flush()?;
    drop(writer);
    part.commit(target)?;

    for (reason, count) in &dropped {
        diagnostics.record(
            Stage::Reconcile,
            Some(&spec.name),
            DiagnosticKind::RowsDropped {
                reason: *reason,
                count: *count,
            },
        );
    }
    if rows_kept == 0 {
        diagnostics.record(Stage::Reconcile, Some(&spec.name), DiagnosticKind::EmptyDataset);
    }

    let mut coercions = mapping.renamed;
    if keys_trimmed > 0 {
        coercions.push(Coercion::KeyNormalized {
            count: keys_trimmed,
        });
    }
    let verdict = if coercions.is_empty() {
        Verdict::Valid
    } else {
        Verdict::ValidWithCoercions(coercions)
    };

    info!(
        rows_read,
        rows_kept,
        rows_dropped = rows_read - rows_kept,
        columns = mapping.schema.columns.len(),
        %verdict,
        "Reconciled dataset"
    );

    Ok(ReconciledDataset {
        name: spec.name.clone(),
        role: spec.role,
        path: target.to_path_buf(),
        schema: mapping.schema,
        verdict,
        missing_columns: mapping.missing,
        rows_read,
        rows_kept,
        dropped,
    })
}

/// Join key first unless listed, then expected columns without duplicates
fn expected_columns(join_key: &str, columns: &[String]) -> Vec<String> {
    let mut expected = Vec::with_capacity(columns.len() + 1);
    if !columns.iter().any(|c| c == join_key) {
        expected.push(join_key.to_string());
    }
    for column in columns {
        if !expected.contains(column) {
            expected.push(column.clone());
        }
    }
    expected
}

/// Header names with the BOM removed and whitespace trimmed
fn clean_header(header: &csv::StringRecord) -> Vec<String> {
    header
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let name = if idx == 0 {
                name.trim_start_matches(UTF8_BOM)
            } else {
                name
            };
            name.trim().to_string()
        })
        .collect()
}

/// Resolve every expected column against the observed header
///
/// Returns `None` when the join key cannot be found.
fn map_columns(
    observed: &[String],
    expected: &[String],
    join_key: &str,
    aliases: &BTreeMap<String, String>,
) -> Option<ColumnMapping> {
    let mut used: HashSet<usize> = HashSet::new();
    let mut sources = Vec::with_capacity(expected.len() + observed.len());
    let mut renamed = Vec::new();
    let mut missing = Vec::new();
    let mut columns: Vec<String> = Vec::with_capacity(expected.len() + observed.len());

    for canonical in expected {
        let found = find_column(observed, canonical, aliases, &used);
        match found {
            Some(idx) => {
                used.insert(idx);
                if observed[idx] != *canonical {
                    renamed.push(Coercion::RenamedColumn {
                        from: observed[idx].clone(),
                        to: canonical.clone(),
                    });
                }
            },
            None if canonical == join_key => return None,
            None => missing.push(canonical.clone()),
        }
        sources.push(found);
        columns.push(canonical.clone());
    }

    for (idx, name) in observed.iter().enumerate() {
        if used.contains(&idx) {
            continue;
        }
        let canonical = aliases.get(name).unwrap_or(name);
        let column = unique_name(&columns, canonical);
        if column != *name {
            debug!(from = %name, to = %column, "Extra column renamed");
            renamed.push(Coercion::RenamedColumn {
                from: name.clone(),
                to: column.clone(),
            });
        }
        sources.push(Some(idx));
        columns.push(column);
    }

    let key_index = columns.iter().position(|c| c == join_key)?;
    Some(ColumnMapping {
        schema: Schema { columns, key_index },
        sources,
        renamed,
        missing,
    })
}

/// Exact name, then alias, then case-insensitive match among unused columns
fn find_column(
    observed: &[String],
    canonical: &str,
    aliases: &BTreeMap<String, String>,
    used: &HashSet<usize>,
) -> Option<usize> {
    let unused = || observed.iter().enumerate().filter(|(idx, _)| !used.contains(idx));

    unused()
        .find(|(_, name)| name.as_str() == canonical)
        .or_else(|| unused().find(|(_, name)| aliases.get(name.as_str()).is_some_and(|c| c == canonical)))
        .or_else(|| unused().find(|(_, name)| name.eq_ignore_ascii_case(canonical)))
        .map(|(idx, _)| idx)
}

fn unique_name(taken: &[String], name: &str) -> String {
    if !taken.iter().any(|t| t == name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", name, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}
