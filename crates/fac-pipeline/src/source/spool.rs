//! On-disk JSON-lines spool for paginated records
//!
//! Pages are appended as they arrive so memory holds one page plus the set of
//! field names seen so far. [`RecordSpool::finish_csv`] converts the spool to
//! CSV once the full column set is known. The spool file is removed when the
//! spool is dropped, whether or not it was converted.

use super::render_json_value;
use crate::error::{PipelineError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub type Record = Map<String, Value>;

/// Append-only spool of JSON objects
pub struct RecordSpool {
    path: PathBuf,
    writer: BufWriter<File>,
    fields: BTreeSet<String>,
    records: u64,
}

impl RecordSpool {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            writer,
            fields: BTreeSet::new(),
            records: 0,
        })
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        for field in record.keys() {
            if !self.fields.contains(field) {
                self.fields.insert(field.clone());
            }
        }
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    /// Header of the CSV rendering
    ///
    /// Expected columns first (the join key in front when not listed), then
    /// the remaining observed fields in sorted order.
    pub fn header(&self, join_key: &str, expected: &[String]) -> Vec<String> {
        let mut header = Vec::with_capacity(expected.len() + self.fields.len() + 1);
        if !expected.iter().any(|c| c == join_key) {
            header.push(join_key.to_string());
        }
        header.extend(expected.iter().cloned());
        for field in &self.fields {
            if !header.contains(field) {
                header.push(field.clone());
            }
        }
        header
    }

    /// Render the spool as CSV at `target` and delete the spool
    pub fn finish_csv(mut self, join_key: &str, expected: &[String], target: &Path) -> Result<u64> {
        self.writer.flush()?;
        let header = self.header(join_key, expected);

        let reader = BufReader::new(File::open(&self.path)?);
        let mut csv_writer = csv::Writer::from_path(target)?;
        csv_writer.write_record(&header)?;

        let mut rows = 0u64;
        for record in serde_json::Deserializer::from_reader(reader).into_iter::<Record>() {
            let record = record?;
            csv_writer.write_record(header.iter().map(|column| {
                record.get(column).map(render_json_value).unwrap_or_default()
            }))?;
            rows += 1;
        }
        csv_writer.flush()?;

        if rows != self.records {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "spool {} holds {} records, expected {}",
                    self.path.display(),
                    rows,
                    self.records
                ),
            )));
        }

        std::fs::remove_file(&self.path)?;
        Ok(rows)
    }
}

impl Drop for RecordSpool {
    fn drop(&mut self) {
        // Already gone after a successful finish_csv
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_spool_renders_expected_then_sorted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = RecordSpool::create(dir.path().join("general.jsonl")).unwrap();
        spool
            .append(&record(json!({"zeta": 1, "report_id": "00123", "auditee_name": "Town"})))
            .unwrap();
        spool
            .append(&record(json!({"report_id": "00124", "alpha": null, "flags": [1, 2]})))
            .unwrap();
        assert_eq!(spool.records(), 2);

        let target = dir.path().join("general.csv");
        let rows = spool
            .finish_csv("report_id", &["auditee_name".to_string()], &target)
            .unwrap();
        assert_eq!(rows, 2);

        let content = std::fs::read_to_string(&target).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "report_id,auditee_name,alpha,flags,zeta");
        assert_eq!(lines[1], "00123,Town,,,1");
        assert_eq!(lines[2], "00124,,,\"[1,2]\",");
        assert!(!dir.path().join("general.jsonl").exists());
    }

    #[test]
    fn test_numbers_keep_their_json_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = RecordSpool::create(dir.path().join("general.jsonl")).unwrap();
        let wide: Record =
            serde_json::from_str(r#"{"report_id": 123456789012345678901234, "amount": 1.50}"#).unwrap();
        let small: Record = serde_json::from_str(r#"{"report_id": 7, "amount": 1e3}"#).unwrap();
        spool.append(&wide).unwrap();
        spool.append(&small).unwrap();

        let target = dir.path().join("general.csv");
        spool.finish_csv("report_id", &[], &target).unwrap();

        assert_eq!(
            std::fs::read_to_string(target).unwrap(),
            "report_id,amount\n123456789012345678901234,1.50\n7,1e3\n"
        );
    }

    #[test]
    fn test_dropped_spool_removes_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findings.jsonl");
        let mut spool = RecordSpool::create(&path).unwrap();
        spool.append(&record(json!({"report_id": "00123"}))).unwrap();
        assert!(path.exists());

        drop(spool);
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_spool_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let spool = RecordSpool::create(dir.path().join("empty.jsonl")).unwrap();
        let target = dir.path().join("empty.csv");
        assert_eq!(spool.finish_csv("report_id", &[], &target).unwrap(), 0);
        assert_eq!(std::fs::read_to_string(target).unwrap(), "report_id\n");
    }
}
