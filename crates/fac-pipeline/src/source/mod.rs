//! Source adapters
//!
//! Each adapter turns one [`DatasetSpec`] into a [`RawDataset`]: a delimited
//! file in the run's scratch directory. Adapters write to a `.part` file and
//! rename it only on success, so a failed dataset leaves nothing behind.
//!
//! - [`api::PaginatedApiSource`]: paged JSON API spooled to disk page by page
//! - [`download::BulkDownloadSource`]: one streamed HTTP download, optionally gzipped
//! - [`local::LocalFileSource`]: an existing file copied into scratch

pub mod api;
pub mod download;
pub mod http;
pub mod local;
pub mod spool;

use crate::config::{DatasetSpec, SourceKind};
use crate::credentials::ApiKey;
use crate::error::{PipelineError, Result};
use crate::progress::RunProgress;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// A dataset materialized as a delimited file on local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDataset {
    pub name: String,
    pub path: PathBuf,
    /// Field delimiter of `path`
    pub delimiter: u8,
    /// Records received, when the transport counts them
    pub rows_fetched: Option<u64>,
    pub bytes: u64,
}

/// Shared inputs of the fetch stage
#[derive(Clone)]
pub struct FetchEnv {
    pub client: reqwest::Client,
    pub api_key: Option<ApiKey>,
    pub retry: RetryPolicy,
    pub default_page_size: usize,
    pub join_key: String,
    pub scratch_dir: PathBuf,
    pub max_concurrent: usize,
    pub progress: RunProgress,
}

impl FetchEnv {
    /// Key for sources that need one; pre-flight checks make this infallible in practice
    pub fn require_api_key(&self, dataset: &str) -> Result<&ApiKey> {
        self.api_key.as_ref().ok_or_else(|| {
            PipelineError::source_unavailable(dataset, "no API key available for remote source")
        })
    }

    pub fn raw_path(&self, dataset: &str) -> PathBuf {
        self.scratch_dir.join(format!("{}.raw", dataset))
    }
}

/// Something that can materialize a dataset
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn materialize(&self, spec: &DatasetSpec, env: &FetchEnv) -> Result<RawDataset>;
}

/// Adapter for a spec's source kind
pub fn adapter_for<'a>(spec: &'a DatasetSpec, env: &FetchEnv) -> Box<dyn DatasetSource + 'a> {
    match &spec.source {
        SourceKind::PaginatedApi(api) => Box::new(api::PaginatedApiSource::new(
            api,
            api.page_size.unwrap_or(env.default_page_size),
        )),
        SourceKind::BulkDownload(download) => Box::new(download::BulkDownloadSource::new(download)),
        SourceKind::LocalFile(local) => Box::new(local::LocalFileSource::new(local)),
    }
}

/// Materialize one dataset
#[instrument(skip_all, fields(dataset = %spec.name, kind = spec.source.as_str()))]
pub async fn fetch_dataset(spec: &DatasetSpec, env: &FetchEnv) -> Result<RawDataset> {
    let raw = adapter_for(spec, env).materialize(spec, env).await?;
    info!(
        rows = raw.rows_fetched,
        bytes = raw.bytes,
        path = %raw.path.display(),
        "Dataset materialized"
    );
    Ok(raw)
}

/// Materialize all datasets with at most `env.max_concurrent` in flight
///
/// The first failure cancels the remaining fetches. Results come back in
/// `specs` order.
pub async fn fetch_all(specs: &[DatasetSpec], env: &FetchEnv) -> Result<Vec<RawDataset>> {
    let mut fetched: Vec<(usize, RawDataset)> = stream::iter(specs.iter().enumerate())
        .map(|(idx, spec)| async move { fetch_dataset(spec, env).await.map(|raw| (idx, raw)) })
        .buffer_unordered(env.max_concurrent.max(1))
        .try_collect()
        .await?;

    fetched.sort_by_key(|(idx, _)| *idx);
    Ok(fetched.into_iter().map(|(_, raw)| raw).collect())
}

/// A file that is deleted on drop unless committed
#[derive(Debug)]
pub struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename to `target`; the part file is no longer cleaned up
    pub fn commit(mut self, target: &Path) -> std::io::Result<()> {
        std::fs::rename(&self.path, target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Decompress a gzip file (all members) into `target`; returns bytes written
pub(crate) fn gunzip_file(source: &Path, target: &Path) -> std::io::Result<u64> {
    let input = std::io::BufReader::new(std::fs::File::open(source)?);
    let mut decoder = flate2::read::MultiGzDecoder::new(input);
    let mut output = std::io::BufWriter::new(std::fs::File::create(target)?);
    let written = std::io::copy(&mut decoder, &mut output)?;
    std::io::Write::flush(&mut output)?;
    Ok(written)
}

/// Render a JSON value as a CSV field
///
/// Numbers keep their JSON text (serde_json's `arbitrary_precision`), so
/// identifiers are never reformatted.
pub fn render_json_value(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
