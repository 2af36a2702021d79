//! Sort-merge left-outer join
//!
//! One forward pass over the key-sorted primary file, with one cursor per
//! key-sorted child file. For each primary key the cursors collect that key's
//! child rows (skipping child keys the primary never has), then every primary
//! row with the key yields one row per combination of expand-child matches.
//! Aggregate children contribute one collapsed value set per key.

use crate::config::{AggregateFunction, MultiplicityPolicy};
use crate::error::{PipelineError, Result};
use crate::schema::Schema;
use csv::{Reader, StringRecord};
use std::fs::File;
use std::path::PathBuf;

/// A key-sorted CSV file with a header matching `schema`
#[derive(Debug, Clone)]
pub struct SortedDataset {
    pub name: String,
    pub path: PathBuf,
    pub schema: Schema,
}

/// A child dataset and how it joins
#[derive(Debug, Clone)]
pub struct JoinChild {
    pub dataset: SortedDataset,
    pub prefix: String,
    pub policy: MultiplicityPolicy,
}

/// One output record, aligned with [`OutputSchema::columns`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRow {
    pub key: String,
    /// `None` renders as an empty field
    pub values: Vec<Option<String>>,
}

/// Header of the merged output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    pub columns: Vec<String>,
    /// Columns renamed to avoid collisions, as `(wanted, given)`
    pub renamed: Vec<(String, String)>,
}

impl OutputSchema {
    /// Primary columns unprefixed, then each child's columns with its prefix
    pub fn build(primary: &Schema, children: &[JoinChild]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut renamed = Vec::new();
        let mut push = |wanted: String, columns: &mut Vec<String>| {
            let mut name = wanted.clone();
            let mut n = 2;
            while columns.contains(&name) {
                name = format!("{}_{}", wanted, n);
                n += 1;
            }
            if name != wanted {
                renamed.push((wanted, name.clone()));
            }
            columns.push(name);
        };

        for column in &primary.columns {
            push(column.clone(), &mut columns);
        }
        for child in children {
            match &child.policy {
                MultiplicityPolicy::Aggregate {
                    function: AggregateFunction::Count,
                    ..
                } => push(format!("{}row_count", child.prefix), &mut columns),
                _ => {
                    for (_, column) in child.dataset.schema.value_columns() {
                        push(format!("{}{}", child.prefix, column), &mut columns);
                    }
                },
            }
        }

        Self { columns, renamed }
    }
}

/// Counters gathered during the join
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub primary_rows: u64,
    pub rows_out: u64,
    /// Keys seen on more than one primary row
    pub duplicate_keys: u64,
    /// Primary rows beyond the first for those keys
    pub duplicate_rows: u64,
    /// Child rows skipped for lack of a primary key, per child in order
    pub unmatched: Vec<(String, u64)>,
}

/// Child rows matching the current key
#[derive(Debug)]
enum ChildMatch {
    /// Value columns of every matching row; never empty once grouped
    Expand(Vec<Vec<String>>),
    /// Collapsed values for the whole key
    Aggregate(Vec<Option<String>>),
}

impl ChildMatch {
    /// Combinations this child contributes
    fn fan_out(&self) -> usize {
        match self {
            ChildMatch::Expand(rows) => rows.len().max(1),
            ChildMatch::Aggregate(_) => 1,
        }
    }
}

struct ChildCursor {
    name: String,
    reader: Reader<File>,
    key_index: usize,
    value_indexes: Vec<usize>,
    policy: MultiplicityPolicy,
    head: StringRecord,
    has_head: bool,
    exhausted: bool,
    unmatched: u64,
}

impl ChildCursor {
    fn open(child: &JoinChild) -> Result<Self> {
        let schema = &child.dataset.schema;
        let mut cursor = Self {
            name: child.dataset.name.clone(),
            reader: Reader::from_path(&child.dataset.path)?,
            key_index: schema.key_index,
            value_indexes: schema.value_columns().map(|(idx, _)| idx).collect(),
            policy: child.policy.clone(),
            head: StringRecord::new(),
            has_head: false,
            exhausted: false,
            unmatched: 0,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    fn advance(&mut self) -> Result<()> {
        if self.exhausted {
            self.has_head = false;
            return Ok(());
        }
        self.has_head = self.reader.read_record(&mut self.head)?;
        self.exhausted = !self.has_head;
        Ok(())
    }

    fn head_key(&self) -> Option<&str> {
        if self.has_head {
            self.head.get(self.key_index)
        } else {
            None
        }
    }

    fn values(&self) -> Vec<String> {
        self.value_indexes
            .iter()
            .map(|&idx| self.head.get(idx).unwrap_or("").to_string())
            .collect()
    }

    /// Collect this key's rows, skipping smaller keys as unmatched
    fn take_matching(&mut self, key: &str) -> Result<ChildMatch> {
        let mut rows: Vec<Vec<String>> = Vec::new();
        while let Some(head) = self.head_key() {
            match head.cmp(key) {
                std::cmp::Ordering::Less => self.unmatched += 1,
                std::cmp::Ordering::Equal => rows.push(self.values()),
                std::cmp::Ordering::Greater => break,
            }
            self.advance()?;
        }

        Ok(match &self.policy {
            MultiplicityPolicy::Expand => ChildMatch::Expand(rows),
            MultiplicityPolicy::Aggregate {
                function: AggregateFunction::Count,
                ..
            } => ChildMatch::Aggregate(vec![Some(rows.len().to_string())]),
            MultiplicityPolicy::Aggregate {
                function: AggregateFunction::Concat,
                separator,
            } => ChildMatch::Aggregate(concat_columns(&rows, self.value_indexes.len(), separator)),
        })
    }

    /// Count everything left as unmatched
    fn drain(&mut self) -> Result<()> {
        while self.has_head {
            self.unmatched += 1;
            self.advance()?;
        }
        Ok(())
    }
}

/// Non-empty values per column joined with `separator`; `None` when all empty
fn concat_columns(rows: &[Vec<String>], width: usize, separator: &str) -> Vec<Option<String>> {
    (0..width)
        .map(|col| {
            let parts: Vec<&str> = rows
                .iter()
                .filter_map(|row| row.get(col).map(String::as_str))
                .filter(|v| !v.is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(separator))
            }
        })
        .collect()
}

/// Child matches of one key, shared by every primary row with that key
struct KeyGroup {
    key: String,
    matches: Vec<ChildMatch>,
}

/// Odometer over expand-child combinations for one primary row
struct Expansion {
    primary: Vec<String>,
    counters: Vec<usize>,
    done: bool,
}

impl Expansion {
    fn next_row(&mut self, group: &KeyGroup) -> Option<MergedRow> {
        if self.done {
            return None;
        }

        let mut values: Vec<Option<String>> = self.primary.iter().cloned().map(Some).collect();
        for (child, counter) in group.matches.iter().zip(&self.counters) {
            match child {
                ChildMatch::Expand(rows) => {
                    if let Some(row) = rows.get(*counter) {
                        values.extend(row.iter().cloned().map(Some));
                    }
                },
                ChildMatch::Aggregate(collapsed) => values.extend(collapsed.iter().cloned()),
            }
        }

        self.done = true;
        for idx in (0..self.counters.len()).rev() {
            self.counters[idx] += 1;
            if self.counters[idx] < group.matches[idx].fan_out() {
                self.done = false;
                break;
            }
            self.counters[idx] = 0;
        }

        Some(MergedRow {
            key: group.key.clone(),
            values,
        })
    }
}

/// Lazy join of one primary with its children
///
/// Yields rows in ascending key order, primary order within a key. Single
/// pass: reading again means opening a new `MergeJoin`.
pub struct MergeJoin {
    primary: Reader<File>,
    primary_key_index: usize,
    record: StringRecord,
    children: Vec<ChildCursor>,
    child_widths: Vec<usize>,
    group: Option<KeyGroup>,
    expansion: Option<Expansion>,
    stats: JoinStats,
    duplicate_counted: bool,
    finished: bool,
}

impl MergeJoin {
    pub fn open(primary: &SortedDataset, children: &[JoinChild]) -> Result<Self> {
        let cursors = children
            .iter()
            .map(ChildCursor::open)
            .collect::<Result<Vec<_>>>()?;
        let child_widths = children
            .iter()
            .map(|c| c.dataset.schema.value_columns().count())
            .collect();

        Ok(Self {
            primary: Reader::from_path(&primary.path)?,
            primary_key_index: primary.schema.key_index,
            record: StringRecord::new(),
            children: cursors,
            child_widths,
            group: None,
            expansion: None,
            stats: JoinStats::default(),
            duplicate_counted: false,
            finished: false,
        })
    }

    pub fn stats(&self) -> &JoinStats {
        &self.stats
    }

    fn next_primary(&mut self) -> Result<bool> {
        if !self.primary.read_record(&mut self.record)? {
            for child in &mut self.children {
                child.drain()?;
            }
            self.stats.unmatched = self
                .children
                .iter()
                .map(|c| (c.name.clone(), c.unmatched))
                .collect();
            return Ok(false);
        }
        self.stats.primary_rows += 1;

        let key = self.record.get(self.primary_key_index).unwrap_or("").to_string();
        let same_key = match &self.group {
            Some(group) if group.key == key => true,
            Some(group) if group.key.as_str() > key.as_str() => {
                return Err(PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "primary input out of order: '{}' after '{}'",
                        key, group.key
                    ),
                )));
            },
            _ => false,
        };

        if same_key {
            self.stats.duplicate_rows += 1;
            if !self.duplicate_counted {
                self.stats.duplicate_keys += 1;
                self.duplicate_counted = true;
            }
        } else {
            self.duplicate_counted = false;
            let mut matches = Vec::with_capacity(self.children.len());
            for (child, width) in self.children.iter_mut().zip(&self.child_widths) {
                let found = child.take_matching(&key)?;
                matches.push(match found {
                    ChildMatch::Expand(rows) if rows.is_empty() => {
                        ChildMatch::Aggregate(vec![None; *width])
                    },
                    other => other,
                });
            }
            self.group = Some(KeyGroup { key, matches });
        }

        self.expansion = Some(Expansion {
            primary: self.record.iter().map(str::to_string).collect(),
            counters: vec![0; self.children.len()],
            done: false,
        });
        Ok(true)
    }
}

impl Iterator for MergeJoin {
    type Item = Result<MergedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(expansion) = self.expansion.as_mut() {
                let row = self.group.as_ref().and_then(|group| expansion.next_row(group));
                match row {
                    Some(row) => {
                        self.stats.rows_out += 1;
                        return Some(Ok(row));
                    },
                    None => self.expansion = None,
                }
            }

            if self.finished {
                return None;
            }
            match self.next_primary() {
                Ok(true) => {},
                Ok(false) => {
                    self.finished = true;
                    return None;
                },
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                },
            }
        }
    }
}
