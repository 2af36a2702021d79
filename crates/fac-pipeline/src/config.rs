//! Pipeline configuration
//!
//! The configuration file is YAML with a `settings` block and an ordered list
//! of `sources`. Each source describes how to materialize one dataset and how
//! it takes part in the merge. See the crate docs for a full example.

use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

fn default_page_size() -> usize {
    1000
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_sort_buffer_rows() -> usize {
    100_000
}

fn default_api_key_env() -> String {
    "SAM_API_KEY".to_string()
}

fn default_records_field() -> String {
    "results".to_string()
}

fn default_offset_param() -> String {
    "from".to_string()
}

fn default_size_param() -> String {
    "size".to_string()
}

fn default_total_count_header() -> String {
    "x-total-count".to_string()
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Settings
// ============================================================================

/// Global run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path of the compressed merged output
    pub output_filename: PathBuf,

    /// Root under which each run creates its scratch directory
    pub download_directory: PathBuf,

    /// Column shared by every dataset
    pub primary_join_key: String,

    /// Page size for paginated sources that don't set their own
    #[serde(default = "default_page_size")]
    pub api_page_size: usize,

    /// Timeout for a single HTTP request
    #[serde(default = "default_timeout_secs")]
    pub api_timeout_seconds: u64,

    /// Attempts per request before a dataset is declared unavailable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Upper bound on datasets fetched at the same time
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Rows held in memory per external-sort run
    #[serde(default = "default_sort_buffer_rows")]
    pub sort_buffer_rows: usize,

    /// Remove the run's scratch directory when the run ends
    #[serde(default = "default_true")]
    pub cleanup_temp_files: bool,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Settings {
    /// Per-request HTTP timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    /// Retry policy shared by every request of the run
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

// ============================================================================
// Dataset specs
// ============================================================================

/// Role of a dataset in the join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetRole {
    /// Defines the universe of output rows
    Primary,
    /// Joined onto the primary by key
    Child,
}

impl std::fmt::Display for DatasetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetRole::Primary => write!(f, "primary"),
            DatasetRole::Child => write!(f, "child"),
        }
    }
}

/// Compression of a downloaded or local file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Gzip when the name ends in `.gz`
    #[default]
    Auto,
    None,
    Gzip,
}

impl Compression {
    /// Whether a file with this name should be gunzipped
    pub fn is_gzip(self, name: &str) -> bool {
        match self {
            Compression::Auto => name.to_ascii_lowercase().ends_with(".gz"),
            Compression::None => false,
            Compression::Gzip => true,
        }
    }
}

/// Paginated JSON API parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSource {
    pub url: String,

    /// Extra query parameters sent with every page
    #[serde(default)]
    pub api_params: BTreeMap<String, serde_json::Value>,

    /// Overrides `settings.api_page_size`
    #[serde(default)]
    pub page_size: Option<usize>,

    /// Body field holding the page's records; a top-level array also works
    #[serde(default = "default_records_field")]
    pub records_field: String,

    #[serde(default = "default_offset_param")]
    pub offset_param: String,

    #[serde(default = "default_size_param")]
    pub size_param: String,

    /// Response header carrying the total record count, when the API sends one
    #[serde(default = "default_total_count_header")]
    pub total_count_header: String,
}

/// Bulk file download parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSource {
    pub url: String,

    #[serde(default)]
    pub compression: Compression,

    /// Send the API key header with the download
    #[serde(default = "default_true")]
    pub requires_credential: bool,
}

/// Local file parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalSource {
    pub path: PathBuf,

    #[serde(default)]
    pub compression: Compression,
}

/// How a dataset is obtained
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceKind {
    PaginatedApi(ApiSource),
    BulkDownload(DownloadSource),
    LocalFile(LocalSource),
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::PaginatedApi(_) => "paginated-api",
            SourceKind::BulkDownload(_) => "bulk-download",
            SourceKind::LocalFile(_) => "local-file",
        }
    }

    /// Whether fetching this source needs the API key
    pub fn requires_credential(&self) -> bool {
        match self {
            SourceKind::PaginatedApi(_) => true,
            SourceKind::BulkDownload(download) => download.requires_credential,
            SourceKind::LocalFile(_) => false,
        }
    }
}

/// Aggregation applied when a child collapses to one row per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    /// Join the non-empty values of each column with the separator
    #[default]
    Concat,
    /// Number of matching child rows
    Count,
}

/// Handling of child datasets with several rows per join key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MultiplicityPolicy {
    /// One output row per matching child row
    Expand,
    /// One output row per primary row
    Aggregate {
        #[serde(default)]
        function: AggregateFunction,
        #[serde(default = "default_separator")]
        separator: String,
    },
}

impl std::fmt::Display for MultiplicityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MultiplicityPolicy::Expand => write!(f, "expand"),
            MultiplicityPolicy::Aggregate {
                function: AggregateFunction::Concat,
                separator,
            } => write!(f, "aggregate(concat '{}')", separator),
            MultiplicityPolicy::Aggregate {
                function: AggregateFunction::Count,
                ..
            } => write!(f, "aggregate(count)"),
        }
    }
}

/// One dataset taking part in the merge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSpec {
    pub name: String,

    #[serde(flatten)]
    pub source: SourceKind,

    pub role: DatasetRole,

    /// Expected columns, in output order
    #[serde(default)]
    pub columns: Vec<String>,

    /// Observed header name -> canonical column name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Prefix for this child's columns in the output (default `<name>_`)
    #[serde(default)]
    pub column_prefix: Option<String>,

    #[serde(default)]
    pub multiplicity: Option<MultiplicityPolicy>,

    /// Field delimiter of the materialized file
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl DatasetSpec {
    /// Output column prefix for this dataset
    pub fn prefix(&self) -> String {
        self.column_prefix
            .clone()
            .unwrap_or_else(|| format!("{}_", self.name))
    }

    /// Delimiter as the byte the csv crate expects
    pub fn delimiter_byte(&self) -> u8 {
        // validate() guarantees an ASCII delimiter
        self.delimiter as u8
    }

    fn validate(&self, settings: &Settings) -> Result<()> {
        let name = &self.name;
        if name.trim().is_empty() {
            return Err(PipelineError::config("source name cannot be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(PipelineError::config(format!(
                "source name '{}' may only contain letters, digits, '_' and '-'",
                name
            )));
        }
        if !self.delimiter.is_ascii() || self.delimiter == '"' || self.delimiter == '\n' {
            return Err(PipelineError::config(format!(
                "source '{}' has unsupported delimiter {:?}",
                name, self.delimiter
            )));
        }

        match (&self.role, &self.multiplicity) {
            (DatasetRole::Primary, Some(_)) => {
                return Err(PipelineError::config(format!(
                    "primary source '{}' cannot declare a multiplicity policy",
                    name
                )));
            },
            (DatasetRole::Child, None) => {
                return Err(PipelineError::config(format!(
                    "child source '{}' must declare a multiplicity policy (expand or aggregate)",
                    name
                )));
            },
            _ => {},
        }

        match &self.source {
            SourceKind::PaginatedApi(api) => {
                validate_url(name, &api.url)?;
                if api.page_size.unwrap_or(settings.api_page_size) == 0 {
                    return Err(PipelineError::config(format!(
                        "source '{}' page size must be greater than 0",
                        name
                    )));
                }
            },
            SourceKind::BulkDownload(download) => validate_url(name, &download.url)?,
            SourceKind::LocalFile(local) => {
                if local.path.as_os_str().is_empty() {
                    return Err(PipelineError::config(format!(
                        "local source '{}' needs a path",
                        name
                    )));
                }
            },
        }

        Ok(())
    }
}

fn validate_url(name: &str, url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url).map_err(|e| {
        PipelineError::config(format!("source '{}' has invalid url '{}': {}", name, url, e))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PipelineError::config(format!(
            "source '{}' url must use http or https, got '{}'",
            name,
            parsed.scheme()
        )));
    }
    Ok(())
}

// ============================================================================
// Pipeline config
// ============================================================================

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub settings: Settings,
    pub sources: Vec<DatasetSpec>,
}

impl PipelineConfig {
    /// Load, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::config(format!(
                "config file '{}' not found",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `FAC_*` environment overrides
    ///
    /// - `FAC_OUTPUT_FILENAME`
    /// - `FAC_DOWNLOAD_DIRECTORY`
    /// - `FAC_MAX_CONCURRENT_FETCHES`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(output) = std::env::var("FAC_OUTPUT_FILENAME") {
            self.settings.output_filename = PathBuf::from(output);
        }

        if let Ok(dir) = std::env::var("FAC_DOWNLOAD_DIRECTORY") {
            self.settings.download_directory = PathBuf::from(dir);
        }

        if let Ok(value) = std::env::var("FAC_MAX_CONCURRENT_FETCHES") {
            self.settings.max_concurrent_fetches = value.parse().map_err(|_| {
                PipelineError::config(format!(
                    "FAC_MAX_CONCURRENT_FETCHES must be a positive integer, got '{}'",
                    value
                ))
            })?;
        }

        Ok(())
    }

    /// Check settings and the dataset list for consistency
    pub fn validate(&self) -> Result<()> {
        let settings = &self.settings;

        if settings.output_filename.as_os_str().is_empty() {
            return Err(PipelineError::config("settings.output_filename cannot be empty"));
        }
        if settings.download_directory.as_os_str().is_empty() {
            return Err(PipelineError::config("settings.download_directory cannot be empty"));
        }
        if settings.primary_join_key.trim().is_empty() {
            return Err(PipelineError::config("settings.primary_join_key cannot be empty"));
        }
        if settings.max_retries == 0 {
            return Err(PipelineError::config("settings.max_retries must be greater than 0"));
        }
        if settings.max_concurrent_fetches == 0 {
            return Err(PipelineError::config(
                "settings.max_concurrent_fetches must be greater than 0",
            ));
        }
        if settings.sort_buffer_rows == 0 {
            return Err(PipelineError::config("settings.sort_buffer_rows must be greater than 0"));
        }
        if settings.api_timeout_seconds == 0 {
            return Err(PipelineError::config(
                "settings.api_timeout_seconds must be greater than 0",
            ));
        }

        if self.sources.is_empty() {
            return Err(PipelineError::config("at least one source is required"));
        }

        let mut names = HashSet::new();
        for spec in &self.sources {
            spec.validate(settings)?;
            if !names.insert(spec.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate source name '{}'",
                    spec.name
                )));
            }
        }

        let primaries = self
            .sources
            .iter()
            .filter(|s| s.role == DatasetRole::Primary)
            .count();
        if primaries != 1 {
            return Err(PipelineError::config(format!(
                "exactly one source must have role 'primary', found {}",
                primaries
            )));
        }

        Ok(())
    }

    /// The primary dataset
    pub fn primary(&self) -> Result<&DatasetSpec> {
        self.sources
            .iter()
            .find(|s| s.role == DatasetRole::Primary)
            .ok_or_else(|| PipelineError::config("no primary source configured"))
    }

    /// Child datasets in configuration order
    pub fn children(&self) -> impl Iterator<Item = &DatasetSpec> {
        self.sources.iter().filter(|s| s.role == DatasetRole::Child)
    }

    /// Whether any source needs the API key
    pub fn requires_credential(&self) -> bool {
        self.sources.iter().any(|s| s.source.requires_credential())
    }

    /// Page size for a paginated source
    pub fn page_size(&self, api: &ApiSource) -> usize {
        api.page_size.unwrap_or(self.settings.api_page_size)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
settings:
  output_filename: out/fac_merged.csv.gz
  download_directory: downloads
  primary_join_key: report_id
  api_page_size: 500
sources:
  - name: general
    kind: paginated-api
    url: https://api.sam.gov/data-services/v3/fac/single_audits/general
    api_params:
      auditYear: 2024
    role: primary
    columns: [report_id, auditee_name]
  - name: findings
    kind: bulk-download
    url: https://example.org/findings.csv.gz
    role: child
    multiplicity:
      policy: expand
  - name: notes
    kind: local-file
    path: ./notes.tsv
    delimiter: "\t"
    role: child
    column_prefix: "note."
    multiplicity:
      policy: aggregate
      function: count
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.settings.primary_join_key, "report_id");
        assert_eq!(config.settings.api_page_size, 500);
        assert_eq!(config.settings.max_retries, 5);
        assert!(config.settings.cleanup_temp_files);
        assert_eq!(config.sources.len(), 3);

        let general = config.primary().unwrap();
        assert_eq!(general.name, "general");
        match &general.source {
            SourceKind::PaginatedApi(api) => {
                assert_eq!(api.records_field, "results");
                assert_eq!(api.offset_param, "from");
                assert_eq!(api.api_params["auditYear"], serde_json::json!(2024));
                assert_eq!(config.page_size(api), 500);
            },
            other => panic!("unexpected source kind {:?}", other),
        }

        let children: Vec<_> = config.children().collect();
        assert_eq!(children[0].multiplicity, Some(MultiplicityPolicy::Expand));
        assert_eq!(children[0].prefix(), "findings_");
        assert_eq!(
            children[1].multiplicity,
            Some(MultiplicityPolicy::Aggregate {
                function: AggregateFunction::Count,
                separator: ";".to_string(),
            })
        );
        assert_eq!(children[1].delimiter_byte(), b'\t');
        assert_eq!(children[1].prefix(), "note.");
        assert!(config.requires_credential());
    }

    #[test]
    fn test_missing_required_setting_is_rejected() {
        let yaml = r#"
settings:
  output_filename: out.csv.gz
sources: []
"#;
        assert!(PipelineConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_child_without_policy_is_rejected() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.sources[1].multiplicity = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("multiplicity"));
    }

    #[test]
    fn test_two_primaries_are_rejected() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.sources[1].role = DatasetRole::Primary;
        config.sources[1].multiplicity = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.sources[2].name = "findings".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_non_http_url_is_rejected() {
        let mut config = PipelineConfig::from_yaml_str(SAMPLE).unwrap();
        config.sources[1].source = SourceKind::BulkDownload(DownloadSource {
            url: "ftp://example.org/findings.csv".to_string(),
            compression: Compression::Auto,
            requires_credential: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_only_config_needs_no_credential() {
        let yaml = r#"
settings:
  output_filename: out.csv.gz
  download_directory: scratch
  primary_join_key: id
sources:
  - name: base
    kind: local-file
    path: base.csv
    role: primary
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        config.validate().unwrap();
        assert!(!config.requires_credential());
    }

    #[test]
    fn test_compression_detection() {
        assert!(Compression::Auto.is_gzip("findings.CSV.GZ"));
        assert!(!Compression::Auto.is_gzip("findings.csv"));
        assert!(Compression::Gzip.is_gzip("download"));
        assert!(!Compression::None.is_gzip("archive.gz"));
    }
}
