//! Bounded-memory external merge sort of delimited files
//!
//! Rows are buffered up to `buffer_rows`, stably sorted by the key column and
//! spilled as headerless run files. Runs are then merged k ways with a binary
//! heap; ties go to the lower run index, which keeps the whole sort stable.
//! More runs than the fan-in are merged in cascaded passes.

use crate::error::Result;
use csv::{ByteRecord, Reader, ReaderBuilder, Writer};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Maximum runs merged at once
pub const MERGE_FAN_IN: usize = 64;

/// What a sort did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortStats {
    pub rows: u64,
    /// Spilled runs before merging (0 when everything fit in memory)
    pub runs: usize,
    /// Merge passes over spilled runs
    pub merge_passes: usize,
}

#[derive(Debug, Clone)]
pub struct ExternalSorter {
    scratch_dir: PathBuf,
    buffer_rows: usize,
    fan_in: usize,
}

impl ExternalSorter {
    pub fn new(scratch_dir: impl Into<PathBuf>, buffer_rows: usize) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            buffer_rows: buffer_rows.max(1),
            fan_in: MERGE_FAN_IN,
        }
    }

    /// Override the merge fan-in (at least 2)
    pub fn with_fan_in(mut self, fan_in: usize) -> Self {
        self.fan_in = fan_in.max(2);
        self
    }

    /// Sort a CSV file with a header row by column `key_index` into `target`
    ///
    /// Keys compare as byte strings. The header is copied unchanged.
    pub fn sort_file(
        &self,
        input: &Path,
        key_index: usize,
        label: &str,
        target: &Path,
    ) -> Result<SortStats> {
        let mut reader = Reader::from_path(input)?;
        let header = reader.byte_headers()?.clone();

        let mut stats = SortStats::default();
        let mut runs: Vec<PathBuf> = Vec::new();
        let mut buffer: Vec<ByteRecord> = Vec::with_capacity(self.buffer_rows.min(65_536));
        let mut record = ByteRecord::new();

        while reader.read_byte_record(&mut record)? {
            stats.rows += 1;
            buffer.push(std::mem::take(&mut record));
            if buffer.len() >= self.buffer_rows {
                runs.push(self.spill(&mut buffer, key_index, label, runs.len())?);
            }
        }

        if runs.is_empty() {
            sort_buffer(&mut buffer, key_index);
            let mut writer = Writer::from_path(target)?;
            writer.write_byte_record(&header)?;
            for row in &buffer {
                writer.write_byte_record(row)?;
            }
            writer.flush()?;
            debug!(label, rows = stats.rows, "Sorted in memory");
            return Ok(stats);
        }

        if !buffer.is_empty() {
            runs.push(self.spill(&mut buffer, key_index, label, runs.len())?);
        }
        stats.runs = runs.len();

        let mut generation = 0usize;
        while runs.len() > self.fan_in {
            generation += 1;
            let mut next = Vec::with_capacity(runs.len().div_ceil(self.fan_in));
            for (idx, group) in runs.chunks(self.fan_in).enumerate() {
                let path = self.run_path(label, generation, idx);
                let mut writer = headerless_writer(&path)?;
                merge_runs(group, key_index, &mut writer)?;
                writer.flush()?;
                remove_runs(group);
                next.push(path);
            }
            stats.merge_passes += 1;
            runs = next;
        }

        let mut writer = Writer::from_path(target)?;
        writer.write_byte_record(&header)?;
        merge_runs(&runs, key_index, &mut writer)?;
        writer.flush()?;
        remove_runs(&runs);
        stats.merge_passes += 1;

        debug!(
            label,
            rows = stats.rows,
            runs = stats.runs,
            passes = stats.merge_passes,
            "Sorted with spilled runs"
        );
        Ok(stats)
    }

    fn spill(
        &self,
        buffer: &mut Vec<ByteRecord>,
        key_index: usize,
        label: &str,
        idx: usize,
    ) -> Result<PathBuf> {
        sort_buffer(buffer, key_index);
        let path = self.run_path(label, 0, idx);
        let mut writer = headerless_writer(&path)?;
        for row in buffer.drain(..) {
            writer.write_byte_record(&row)?;
        }
        writer.flush()?;
        Ok(path)
    }

    fn run_path(&self, label: &str, generation: usize, idx: usize) -> PathBuf {
        self.scratch_dir.join(format!("{}.sort-{}-{:05}.run", label, generation, idx))
    }
}

fn key_of(record: &ByteRecord, key_index: usize) -> &[u8] {
    record.get(key_index).unwrap_or_default()
}

/// Stable in-memory sort by key
fn sort_buffer(buffer: &mut [ByteRecord], key_index: usize) {
    buffer.sort_by(|a, b| key_of(a, key_index).cmp(key_of(b, key_index)));
}

fn headerless_writer(path: &Path) -> Result<Writer<File>> {
    Ok(csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?)
}

fn headerless_reader(path: &Path) -> Result<Reader<File>> {
    Ok(ReaderBuilder::new().has_headers(false).from_path(path)?)
}

fn remove_runs(runs: &[PathBuf]) {
    for run in runs {
        let _ = std::fs::remove_file(run);
    }
}

/// k-way merge of sorted headerless runs, earlier runs first on equal keys
fn merge_runs<W: Write>(runs: &[PathBuf], key_index: usize, writer: &mut Writer<W>) -> Result<()> {
    let mut readers = runs
        .iter()
        .map(|p| headerless_reader(p))
        .collect::<Result<Vec<_>>>()?;
    let mut heads: Vec<ByteRecord> = vec![ByteRecord::new(); readers.len()];
    let mut heap: BinaryHeap<Reverse<(Vec<u8>, usize)>> = BinaryHeap::with_capacity(readers.len());

    for (idx, reader) in readers.iter_mut().enumerate() {
        if reader.read_byte_record(&mut heads[idx])? {
            heap.push(Reverse((key_of(&heads[idx], key_index).to_vec(), idx)));
        }
    }

    while let Some(Reverse((_, idx))) = heap.pop() {
        writer.write_byte_record(&heads[idx])?;
        if readers[idx].read_byte_record(&mut heads[idx])? {
            heap.push(Reverse((key_of(&heads[idx], key_index).to_vec(), idx)));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn write_input(dir: &Path, rows: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("input.csv");
        let mut writer = Writer::from_path(&path).unwrap();
        writer.write_record(["report_id", "seq"]).unwrap();
        for (key, seq) in rows {
            writer.write_record([*key, *seq]).unwrap();
        }
        writer.flush().unwrap();
        path
    }

    fn read_rows(path: &Path) -> Vec<(String, String)> {
        let mut reader = Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| {
                let r = r.unwrap();
                (r[0].to_string(), r[1].to_string())
            })
            .collect()
    }

    const ROWS: &[(&str, &str)] = &[
        ("C", "1"),
        ("A", "2"),
        ("B", "3"),
        ("A", "4"),
        ("00123", "5"),
        ("C", "6"),
        ("A", "7"),
    ];

    fn expected() -> Vec<(String, String)> {
        let mut rows: Vec<(String, String)> = ROWS
            .iter()
            .map(|(k, s)| (k.to_string(), s.to_string()))
            .collect();
        rows.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        rows
    }

    #[test]
    fn test_in_memory_sort_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), ROWS);
        let target = dir.path().join("sorted.csv");

        let stats = ExternalSorter::new(dir.path(), 100)
            .sort_file(&input, 0, "general", &target)
            .unwrap();

        assert_eq!(stats, SortStats { rows: 7, runs: 0, merge_passes: 0 });
        assert_eq!(read_rows(&target), expected());
    }

    #[test]
    fn test_spilled_sort_with_cascaded_merge_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), ROWS);
        let target = dir.path().join("sorted.csv");

        let stats = ExternalSorter::new(dir.path(), 1)
            .with_fan_in(2)
            .sort_file(&input, 0, "general", &target)
            .unwrap();

        assert_eq!(stats.runs, 7);
        assert!(stats.merge_passes >= 3);
        assert_eq!(read_rows(&target), expected());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".run"))
            .collect();
        assert!(leftovers.is_empty(), "run files are removed after merging");
    }

    #[test]
    fn test_header_only_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), &[]);
        let target = dir.path().join("sorted.csv");

        let stats = ExternalSorter::new(dir.path(), 10)
            .sort_file(&input, 0, "empty", &target)
            .unwrap();
        assert_eq!(stats.rows, 0);
        assert_eq!(std::fs::read_to_string(target).unwrap(), "report_id,seq\n");
    }
}
