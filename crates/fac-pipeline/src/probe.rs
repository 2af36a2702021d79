//! Endpoint probe
//!
//! Requests a single record from every paginated source to check that the
//! endpoint, the query parameters and the API key are accepted. No retries.

use crate::config::{PipelineConfig, SourceKind};
use crate::credentials::ApiKey;
use crate::source::api::{extract_records, page_request};
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

/// Outcome for one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub dataset: String,
    pub url: String,
    pub status: Option<u16>,
    pub records: Option<usize>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl std::fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self
            .status
            .map_or_else(|| "---".to_string(), |s| s.to_string());
        match (&self.error, self.records) {
            (None, Some(records)) => write!(
                f,
                "{:<24} {} OK ({} record(s)) {}",
                self.dataset, status, records, self.url
            ),
            (Some(error), _) => write!(
                f,
                "{:<24} {} FAILED {} ({})",
                self.dataset, status, self.url, error
            ),
            (None, None) => write!(f, "{:<24} {} {}", self.dataset, status, self.url),
        }
    }
}

/// Probe every paginated source concurrently, in configuration order
pub async fn probe_sources(
    config: &PipelineConfig,
    client: &Client,
    key: Option<&ApiKey>,
) -> Vec<ProbeResult> {
    let probes = config.sources.iter().filter_map(|spec| match &spec.source {
        SourceKind::PaginatedApi(api) => Some(async move {
            let mut result = ProbeResult {
                dataset: spec.name.clone(),
                url: api.url.clone(),
                status: None,
                records: None,
                error: None,
            };

            let response = match page_request(client, api, key, 0, 1).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(dataset = %spec.name, error = %e, "Probe request failed");
                    result.error = Some(e.to_string());
                    return result;
                },
            };

            let status = response.status();
            result.status = Some(status.as_u16());
            if !status.is_success() {
                result.error = Some(format!("HTTP {}", status));
                return result;
            }

            match response.json::<serde_json::Value>().await {
                Ok(body) => match extract_records(body, &api.records_field) {
                    Ok(records) => result.records = Some(records.len()),
                    Err(reason) => result.error = Some(reason),
                },
                Err(e) => result.error = Some(format!("malformed JSON body: {}", e)),
            }
            debug!(dataset = %spec.name, status = status.as_u16(), "Probed endpoint");
            result
        }),
        _ => None,
    });

    join_all(probes).await
}
