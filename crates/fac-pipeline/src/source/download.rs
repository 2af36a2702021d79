//! Bulk file download adapter
//!
//! The body is streamed to a part file. Gzip payloads are decompressed in the
//! same attempt, so a truncated or corrupt archive is retried like any other
//! transient failure. Every attempt starts from scratch.

use super::http::{classify_reqwest, classify_status, API_KEY_HEADER};
use super::{gunzip_file, DatasetSource, FetchEnv, PartFile, RawDataset};
use crate::config::{DatasetSpec, DownloadSource};
use crate::credentials::ApiKey;
use crate::error::{PipelineError, Result};
use crate::retry::{with_retry, AttemptError};
use async_trait::async_trait;
use futures::StreamExt;
use indicatif::ProgressBar;
use reqwest::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;

pub struct BulkDownloadSource<'a> {
    download: &'a DownloadSource,
}

impl<'a> BulkDownloadSource<'a> {
    pub fn new(download: &'a DownloadSource) -> Self {
        Self { download }
    }

    fn is_gzip(&self) -> bool {
        let path = reqwest::Url::parse(&self.download.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.download.url.clone());
        self.download.compression.is_gzip(&path)
    }
}

#[async_trait]
impl DatasetSource for BulkDownloadSource<'_> {
    async fn materialize(&self, spec: &DatasetSpec, env: &FetchEnv) -> Result<RawDataset> {
        let key = if self.download.requires_credential {
            Some(env.require_api_key(&spec.name)?)
        } else {
            None
        };

        let request = DownloadRequest {
            client: &env.client,
            url: &self.download.url,
            key,
            gzip: self.is_gzip(),
            scratch_dir: &env.scratch_dir,
            dataset: &spec.name,
        };
        let pb = env.progress.download_bar(&spec.name, None);
        let label = format!("{} download", spec.name);

        let path = env.raw_path(&spec.name);
        let bytes = with_retry(env.retry, &label, |attempt| {
            request.attempt(attempt, &path, &pb, &label)
        })
        .await
        .map_err(|e| PipelineError::source_unavailable(&spec.name, e.to_string()))?;
        pb.finish();

        Ok(RawDataset {
            name: spec.name.clone(),
            path,
            delimiter: spec.delimiter_byte(),
            rows_fetched: None,
            bytes,
        })
    }
}

struct DownloadRequest<'a> {
    client: &'a Client,
    url: &'a str,
    key: Option<&'a ApiKey>,
    gzip: bool,
    scratch_dir: &'a Path,
    dataset: &'a str,
}

impl DownloadRequest<'_> {
    /// One full download attempt; returns bytes of the materialized file
    async fn attempt(
        &self,
        attempt: u32,
        target: &Path,
        pb: &ProgressBar,
        context: &str,
    ) -> std::result::Result<u64, AttemptError> {
        let local = |e: std::io::Error| AttemptError::permanent(format!("{}: {}", context, e));

        let mut request = self.client.get(self.url);
        if let Some(key) = self.key {
            request = request.header(API_KEY_HEADER, key.expose());
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest(context, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(context, status));
        }

        pb.reset();
        if let Some(total) = response.content_length() {
            pb.set_length(total);
        }
        pb.set_message(format!("attempt {}", attempt));

        let download = PartFile::new(self.scratch_dir.join(format!("{}.download.part", self.dataset)));
        let mut file = tokio::fs::File::create(download.path()).await.map_err(local)?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_reqwest(context, &e))?;
            file.write_all(&chunk).await.map_err(local)?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }
        file.flush().await.map_err(local)?;
        drop(file);

        if !self.gzip {
            download.commit(target).map_err(local)?;
            return Ok(downloaded);
        }

        let csv = PartFile::new(self.scratch_dir.join(format!("{}.raw.part", self.dataset)));
        let source = download.path().to_path_buf();
        let dest = csv.path().to_path_buf();
        let written = tokio::task::spawn_blocking(move || gunzip_file(&source, &dest))
            .await
            .map_err(|e| AttemptError::permanent(format!("{}: {}", context, e)))?
            .map_err(|e| {
                AttemptError::transient(format!("{}: corrupt gzip payload: {}", context, e))
            })?;
        csv.commit(target).map_err(local)?;
        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::progress::RunProgress;
    use crate::retry::RetryPolicy;
    use crate::source::http::build_client;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FINDINGS_CSV: &str = "report_id,reference\nA,x1\nB,y1\nA,x2\n";

    fn source(url: &str, compression: Compression) -> DownloadSource {
        DownloadSource {
            url: url.to_string(),
            compression,
            requires_credential: false,
        }
    }

    fn spec(url: &str) -> DatasetSpec {
        serde_yaml::from_str(&format!(
            "name: findings\nkind: bulk-download\nurl: {}\nrole: child\nmultiplicity: {{ policy: expand }}\n",
            url
        ))
        .unwrap()
    }

    fn fetch_env(scratch: &Path) -> FetchEnv {
        FetchEnv {
            client: build_client(Duration::from_secs(5)).unwrap(),
            api_key: Some(ApiKey::new("test-key")),
            retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
            default_page_size: 100,
            join_key: "report_id".to_string(),
            scratch_dir: scratch.to_path_buf(),
            max_concurrent: 1,
            progress: RunProgress::hidden(),
        }
    }

    fn gzipped(content: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    async fn materialize(spec: &DatasetSpec, scratch: &Path) -> Result<RawDataset> {
        let download = match &spec.source {
            crate::config::SourceKind::BulkDownload(download) => download,
            other => panic!("unexpected source {:?}", other),
        };
        BulkDownloadSource::new(download)
            .materialize(spec, &fetch_env(scratch))
            .await
    }

    fn scratch_files(scratch: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(scratch)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_gzip_detection_uses_url_path() {
        let s = source("https://example.org/findings.csv.gz?token=1", Compression::Auto);
        assert!(BulkDownloadSource::new(&s).is_gzip());

        let s = source("https://example.org/export?format=csv.gz", Compression::Auto);
        assert!(!BulkDownloadSource::new(&s).is_gzip());

        let s = source("https://example.org/export", Compression::Gzip);
        assert!(BulkDownloadSource::new(&s).is_gzip());
    }

    #[tokio::test]
    async fn test_plain_download_is_renamed_into_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/findings.csv"))
            .and(header(API_KEY_HEADER, "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FINDINGS_CSV))
            .expect(1)
            .mount(&server)
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let spec = spec(&format!("{}/findings.csv", server.uri()));
        let raw = materialize(&spec, scratch.path()).await.unwrap();

        assert_eq!(raw.path, scratch.path().join("findings.raw"));
        assert_eq!(raw.bytes, FINDINGS_CSV.len() as u64);
        assert_eq!(raw.rows_fetched, None);
        assert_eq!(raw.delimiter, b',');
        assert_eq!(std::fs::read_to_string(&raw.path).unwrap(), FINDINGS_CSV);
        assert_eq!(scratch_files(scratch.path()), vec!["findings.raw"]);
    }

    #[tokio::test]
    async fn test_gzip_download_retried_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/findings.csv.gz"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/findings.csv.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(gzipped(FINDINGS_CSV)))
            .expect(1)
            .mount(&server)
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let spec = spec(&format!("{}/findings.csv.gz", server.uri()));
        let raw = materialize(&spec, scratch.path()).await.unwrap();

        assert_eq!(raw.bytes, FINDINGS_CSV.len() as u64);
        assert_eq!(std::fs::read_to_string(&raw.path).unwrap(), FINDINGS_CSV);
        assert_eq!(scratch_files(scratch.path()), vec!["findings.raw"]);
    }

    #[tokio::test]
    async fn test_truncated_gzip_restarts_from_scratch() {
        let payload = gzipped(FINDINGS_CSV);
        let truncated = payload[..payload.len() / 2].to_vec();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/findings.csv.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(truncated))
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/findings.csv.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload))
            .expect(1)
            .mount(&server)
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let spec = spec(&format!("{}/findings.csv.gz", server.uri()));
        let raw = materialize(&spec, scratch.path()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&raw.path).unwrap(), FINDINGS_CSV);
        assert_eq!(scratch_files(scratch.path()), vec!["findings.raw"]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/findings.csv.gz"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let spec = spec(&format!("{}/findings.csv.gz", server.uri()));
        let err = materialize(&spec, scratch.path()).await.unwrap_err();

        assert!(matches!(err, PipelineError::SourceUnavailable { .. }), "got {:?}", err);
        assert_eq!(err.exit_code(), 4);
        assert!(scratch_files(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let spec = spec(&format!("{}/findings.csv", server.uri()));
        let err = materialize(&spec, scratch.path()).await.unwrap_err();

        assert!(err.to_string().contains("404"), "got {}", err);
        assert!(scratch_files(scratch.path()).is_empty());
    }
}
