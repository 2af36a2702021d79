//! Shared helpers for integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Write `content` to `dir/name` and return the path
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Settings block pointing output and scratch into `dir`
pub fn settings_yaml(dir: &Path, api_key_env: &str) -> String {
    format!(
        r#"settings:
  output_filename: "{output}"
  download_directory: "{scratch}"
  primary_join_key: report_id
  api_page_size: 2
  max_retries: 3
  retry_base_delay_ms: 10
  retry_max_delay_ms: 50
  api_timeout_seconds: 5
  api_key_env: {api_key_env}
"#,
        output = dir.join("out").join("merged.csv.gz").display(),
        scratch = dir.join("scratch").display(),
        api_key_env = api_key_env,
    )
}

/// General/findings fixture as local files; returns the sources block
pub fn local_sources_yaml(dir: &Path, findings_multiplicity: &str) -> String {
    let general = write_file(
        dir,
        "general.csv",
        "report_id,auditee_name,ein\nA,Alpha,00123\nB,Beta,00456\nC,Gamma,00789\n",
    );
    let findings = write_file(dir, "findings.csv", "report_id,reference\nA,x1\nB,y1\nA,x2\n");

    format!(
        r#"sources:
  - name: general
    kind: local-file
    path: "{general}"
    role: primary
  - name: findings
    kind: local-file
    path: "{findings}"
    role: child
    multiplicity: {findings_multiplicity}
"#,
        general = general.display(),
        findings = findings.display(),
        findings_multiplicity = findings_multiplicity,
    )
}

/// Decompress a merged output into rows, header first
pub fn read_output(path: &Path) -> Vec<Vec<String>> {
    let decoder = GzDecoder::new(File::open(path).unwrap());
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(decoder);
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

/// Rows rendered as comma-joined strings for compact assertions
pub fn render(rows: &[Vec<String>]) -> Vec<String> {
    rows.iter().map(|r| r.join(",")).collect()
}

/// Scratch root holds no run directories
pub fn scratch_is_clean(dir: &Path) -> bool {
    let scratch = dir.join("scratch");
    !scratch.exists() || std::fs::read_dir(&scratch).unwrap().next().is_none()
}
