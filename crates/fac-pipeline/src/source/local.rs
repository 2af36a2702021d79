//! Local file adapter

use super::{gunzip_file, DatasetSource, FetchEnv, PartFile, RawDataset};
use crate::config::{DatasetSpec, LocalSource};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use tracing::debug;

pub struct LocalFileSource<'a> {
    local: &'a LocalSource,
}

impl<'a> LocalFileSource<'a> {
    pub fn new(local: &'a LocalSource) -> Self {
        Self { local }
    }
}

#[async_trait]
impl DatasetSource for LocalFileSource<'_> {
    async fn materialize(&self, spec: &DatasetSpec, env: &FetchEnv) -> Result<RawDataset> {
        let source = self.local.path.clone();
        let unavailable = |cause: String| PipelineError::source_unavailable(&spec.name, cause);

        let metadata = tokio::fs::metadata(&source)
            .await
            .map_err(|e| unavailable(format!("cannot read '{}': {}", source.display(), e)))?;
        if !metadata.is_file() {
            return Err(unavailable(format!("'{}' is not a regular file", source.display())));
        }

        let gzip = self
            .local
            .compression
            .is_gzip(&source.to_string_lossy());
        let part = PartFile::new(env.scratch_dir.join(format!("{}.raw.part", spec.name)));
        let dest = part.path().to_path_buf();
        debug!(dataset = %spec.name, source = %source.display(), gzip, "Copying local file");

        let from = source.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            if gzip {
                gunzip_file(&from, &dest)
            } else {
                std::fs::copy(&from, &dest)
            }
        })
        .await?
        .map_err(|e| unavailable(format!("cannot copy '{}': {}", source.display(), e)))?;

        let path = env.raw_path(&spec.name);
        part.commit(&path)?;

        Ok(RawDataset {
            name: spec.name.clone(),
            path,
            delimiter: spec.delimiter_byte(),
            rows_fetched: None,
            bytes,
        })
    }
}
