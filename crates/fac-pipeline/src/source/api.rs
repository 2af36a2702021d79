//! Paginated JSON API adapter
//!
//! Pages are requested with offset/size query parameters until a short page
//! comes back or the total-count header is exhausted. Every page is retried
//! on its own, so a transient failure on page N does not refetch pages 1..N-1.

use super::http::{classify_reqwest, classify_status, API_KEY_HEADER};
use super::spool::{Record, RecordSpool};
use super::{render_json_value, DatasetSource, FetchEnv, PartFile, RawDataset};
use crate::config::{ApiSource, DatasetSpec};
use crate::credentials::ApiKey;
use crate::error::{PipelineError, Result};
use crate::retry::{with_retry, AttemptError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

/// One decoded page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    /// Value of the total-count header, when sent
    pub total: Option<u64>,
}

pub struct PaginatedApiSource<'a> {
    api: &'a ApiSource,
    page_size: usize,
}

impl<'a> PaginatedApiSource<'a> {
    pub fn new(api: &'a ApiSource, page_size: usize) -> Self {
        Self { api, page_size }
    }
}

#[async_trait]
impl DatasetSource for PaginatedApiSource<'_> {
    async fn materialize(&self, spec: &DatasetSpec, env: &FetchEnv) -> Result<RawDataset> {
        let key = env.require_api_key(&spec.name)?;
        let api = self.api;
        let page_size = self.page_size;
        let client = &env.client;

        let mut spool = RecordSpool::create(env.scratch_dir.join(format!("{}.jsonl", spec.name)))?;
        let pb = env.progress.records_spinner(&spec.name);

        let mut offset: u64 = 0;
        let mut total: Option<u64> = None;
        let mut page_number: u32 = 1;

        loop {
            let label = format!("{} page {}", spec.name, page_number);
            let label_ref = label.as_str();
            let page = with_retry(env.retry, label_ref, move |_| {
                fetch_page(client, api, Some(key), offset, page_size, label_ref)
            })
            .await
            .map_err(|e| PipelineError::source_unavailable(&spec.name, e.to_string()))?;

            let count = page.records.len();
            for record in &page.records {
                spool.append(record)?;
            }
            offset += count as u64;
            pb.inc(count as u64);
            total = page.total.or(total);

            debug!(
                dataset = %spec.name,
                page = page_number,
                records = count,
                offset,
                total,
                "Fetched page"
            );

            if count < page_size {
                break;
            }
            if total.is_some_and(|t| offset >= t) {
                break;
            }
            page_number += 1;
        }

        let part = PartFile::new(env.scratch_dir.join(format!("{}.raw.part", spec.name)));
        let rows = spool.finish_csv(&env.join_key, &spec.columns, part.path())?;
        let path = env.raw_path(&spec.name);
        part.commit(&path)?;
        pb.finish_with_message(format!("done ({} pages)", page_number));

        Ok(RawDataset {
            name: spec.name.clone(),
            bytes: std::fs::metadata(&path)?.len(),
            path,
            delimiter: b',',
            rows_fetched: Some(rows),
        })
    }
}

/// Build the request for one page
///
/// Paging parameters always come from the adapter; `api_params` entries with
/// the same names are not sent.
pub fn page_request(
    client: &Client,
    api: &ApiSource,
    key: Option<&ApiKey>,
    offset: u64,
    size: usize,
) -> RequestBuilder {
    let mut query: Vec<(String, String)> = api
        .api_params
        .iter()
        .filter(|(name, _)| **name != api.size_param && **name != api.offset_param)
        .map(|(name, value)| (name.clone(), render_json_value(value)))
        .collect();
    query.push((api.size_param.clone(), size.to_string()));
    query.push((api.offset_param.clone(), offset.to_string()));

    let mut request = client
        .get(&api.url)
        .query(&query)
        .header(ACCEPT, "application/json");
    if let Some(key) = key {
        request = request.header(API_KEY_HEADER, key.expose());
    }
    request
}

/// Fetch and decode one page as a single attempt
pub async fn fetch_page(
    client: &Client,
    api: &ApiSource,
    key: Option<&ApiKey>,
    offset: u64,
    size: usize,
    context: &str,
) -> std::result::Result<Page, AttemptError> {
    let response = page_request(client, api, key, offset, size)
        .send()
        .await
        .map_err(|e| classify_reqwest(context, &e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(context, status));
    }

    let total = total_count(response.headers(), &api.total_count_header);
    let body = response
        .bytes()
        .await
        .map_err(|e| classify_reqwest(context, &e))?;
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| AttemptError::permanent(format!("{}: malformed JSON body: {}", context, e)))?;

    let records = extract_records(value, &api.records_field)
        .map_err(|reason| AttemptError::permanent(format!("{}: {}", context, reason)))?;

    Ok(Page { records, total })
}

/// Records of a decoded body
///
/// Accepts a top-level array or an object holding the array under `field`.
/// An object without `field` (or with `null`) is an empty page.
pub fn extract_records(body: Value, field: &str) -> std::result::Result<Vec<Record>, String> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(field) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(format!(
                    "field '{}' is {}, expected an array of records",
                    field,
                    json_type(&other)
                ))
            },
        },
        other => {
            return Err(format!(
                "response body is {}, expected an object or array",
                json_type(&other)
            ))
        },
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            Value::Object(record) => Ok(record),
            other => Err(format!("record {} is {}, expected an object", idx, json_type(&other))),
        })
        .collect()
}

fn total_count(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
