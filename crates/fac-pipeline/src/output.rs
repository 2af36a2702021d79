//! Gzip CSV output writer
//!
//! Rows are streamed into `<output>.partial` and the file is renamed into place
//! only after the gzip trailer is written and synced. Dropping an unfinished
//! writer deletes the partial file, so a failed run never leaves output behind.

use crate::error::{PipelineError, Result};
use crate::join::MergedRow;
use fac_common::checksum::compute_file_sha256;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The finished output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

type GzCsvWriter = csv::Writer<GzEncoder<BufWriter<File>>>;

pub struct OutputWriter {
    path: PathBuf,
    partial: PathBuf,
    writer: Option<GzCsvWriter>,
    rows: u64,
    committed: bool,
}

impl OutputWriter {
    /// Create `<path>.partial` and write the header
    pub fn create(path: &Path, header: &[String]) -> Result<Self> {
        let partial = partial_path(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::output_write(path, e))?;
        }

        let file = File::create(&partial).map_err(|e| PipelineError::output_write(path, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut writer = Self {
            path: path.to_path_buf(),
            partial,
            writer: Some(csv::Writer::from_writer(encoder)),
            rows: 0,
            committed: false,
        };
        writer.write_fields(header.iter().map(String::as_str))?;
        debug!(path = %writer.partial.display(), columns = header.len(), "Opened output");
        Ok(writer)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn write_row(&mut self, row: &MergedRow) -> Result<()> {
        self.write_fields(row.values.iter().map(|v| v.as_deref().unwrap_or("")))?;
        self.rows += 1;
        Ok(())
    }

    fn write_fields<'a>(&mut self, fields: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let path = &self.path;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipelineError::output_write(path, "writer already closed"))?;
        writer
            .write_record(fields)
            .map_err(|e| PipelineError::output_write(path, e))
    }

    /// Flush, finish the gzip stream, sync, hash and rename into place
    ///
    /// Any failure before the rename leaves no file at the output path.
    pub fn finish(mut self) -> Result<OutputArtifact> {
        let path = self.path.clone();
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PipelineError::output_write(&path, "writer already closed"))?;

        let encoder = writer
            .into_inner()
            .map_err(|e| PipelineError::output_write(&path, e.error()))?;
        let buffered = encoder
            .finish()
            .map_err(|e| PipelineError::output_write(&path, e))?;
        let file = buffered
            .into_inner()
            .map_err(|e| PipelineError::output_write(&path, e.error()))?;
        file.sync_all()
            .map_err(|e| PipelineError::output_write(&path, e))?;
        drop(file);

        let bytes = std::fs::metadata(&self.partial)
            .map_err(|e| PipelineError::output_write(&path, e))?
            .len();
        let sha256 = compute_file_sha256(&self.partial)
            .map_err(|e| PipelineError::output_write(&path, e))?;

        std::fs::rename(&self.partial, &path).map_err(|e| PipelineError::output_write(&path, e))?;
        self.committed = true;

        info!(path = %path.display(), rows = self.rows, bytes, %sha256, "Output written");
        Ok(OutputArtifact {
            path,
            rows: self.rows,
            bytes,
            sha256,
        })
    }
}

impl Drop for OutputWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Close the encoder before unlinking
        self.writer = None;
        if std::fs::remove_file(&self.partial).is_ok() {
            debug!(path = %self.partial.display(), "Removed partial output");
        }
    }
}

/// `<path>.partial`
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

/// Stream merged rows into a new output file
///
/// The first error from `rows` aborts the write and removes the partial file.
pub fn write_merged<I>(path: &Path, header: &[String], rows: I) -> Result<OutputArtifact>
where
    I: IntoIterator<Item = Result<MergedRow>>,
{
    let mut writer = OutputWriter::create(path, header)?;
    for row in rows {
        writer.write_row(&row?)?;
    }
    writer.finish()
}
