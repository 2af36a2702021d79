//! End-to-end runs over local files and a mock API

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{local_sources_yaml, read_output, render, scratch_is_clean, settings_yaml, write_file};
use fac_common::checksum::compute_file_sha256;
use fac_pipeline::progress::RunProgress;
use fac_pipeline::{pipeline, PipelineConfig, PipelineError};
use serde_json::json;
use serial_test::serial;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn load(yaml: &str) -> PipelineConfig {
    let config = PipelineConfig::from_yaml_str(yaml).unwrap();
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn test_expand_child_yields_row_per_match() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}{}",
        settings_yaml(dir.path(), "FAC_IT_UNUSED_KEY"),
        local_sources_yaml(dir.path(), "{ policy: expand }")
    );
    let config = load(&yaml);

    let summary = pipeline::run(&config, RunProgress::hidden()).await.unwrap();
    assert_eq!(summary.primary_rows, 3);
    assert_eq!(summary.merged_rows, 4);
    assert_eq!(summary.output.rows, 4);

    let rows = read_output(&config.settings.output_filename);
    assert_eq!(
        render(&rows),
        vec![
            "report_id,auditee_name,ein,findings_reference",
            "A,Alpha,00123,x1",
            "A,Alpha,00123,x2",
            "B,Beta,00456,y1",
            "C,Gamma,00789,",
        ]
    );
    assert!(scratch_is_clean(dir.path()));
}

#[tokio::test]
async fn test_aggregate_child_keeps_primary_cardinality() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}{}",
        settings_yaml(dir.path(), "FAC_IT_UNUSED_KEY"),
        local_sources_yaml(dir.path(), "{ policy: aggregate, function: concat }")
    );
    let config = load(&yaml);

    let summary = pipeline::run(&config, RunProgress::hidden()).await.unwrap();
    assert_eq!(summary.merged_rows, summary.primary_rows);

    let rows = read_output(&config.settings.output_filename);
    assert_eq!(
        render(&rows[1..]),
        vec!["A,Alpha,00123,x1;x2", "B,Beta,00456,y1", "C,Gamma,00789,"]
    );
}

#[tokio::test]
async fn test_output_is_byte_identical_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}{}",
        settings_yaml(dir.path(), "FAC_IT_UNUSED_KEY"),
        local_sources_yaml(dir.path(), "{ policy: expand }")
    );
    let config = load(&yaml);

    let first = pipeline::run(&config, RunProgress::hidden()).await.unwrap();
    let first_bytes = std::fs::read(&config.settings.output_filename).unwrap();
    let second = pipeline::run(&config, RunProgress::hidden()).await.unwrap();
    let second_bytes = std::fs::read(&config.settings.output_filename).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.output.sha256, second.output.sha256);
    assert_eq!(
        compute_file_sha256(&config.settings.output_filename).unwrap(),
        second.output.sha256
    );
}

#[tokio::test]
async fn test_missing_key_column_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let general = write_file(dir.path(), "general.csv", "id,auditee_name\nA,Alpha\n");
    let yaml = format!(
        r#"{}sources:
  - name: general
    kind: local-file
    path: "{}"
    role: primary
"#,
        settings_yaml(dir.path(), "FAC_IT_UNUSED_KEY"),
        general.display()
    );
    let config = load(&yaml);

    let err = pipeline::run(&config, RunProgress::hidden()).await.unwrap_err();
    assert!(matches!(err, PipelineError::SchemaViolation { .. }), "got {:?}", err);
    assert_eq!(err.exit_code(), 5);
    assert!(!config.settings.output_filename.exists());
    assert!(scratch_is_clean(dir.path()));
}

#[tokio::test]
async fn test_aliased_key_header_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let general = write_file(
        dir.path(),
        "general.tsv",
        "\u{feff}REPORT_ID\tName\n 0042 \tAlpha\n\tNobody\n",
    );
    let yaml = format!(
        r#"{}sources:
  - name: general
    kind: local-file
    path: "{}"
    delimiter: "\t"
    role: primary
    columns: [report_id, auditee_name]
    aliases:
      Name: auditee_name
"#,
        settings_yaml(dir.path(), "FAC_IT_UNUSED_KEY"),
        general.display()
    );
    let config = load(&yaml);

    let summary = pipeline::run(&config, RunProgress::hidden()).await.unwrap();
    assert_eq!(summary.datasets[0].rows_read, 2);
    assert_eq!(summary.datasets[0].rows_kept, 1);
    assert!(summary.datasets[0].verdict.is_valid());
    assert!(!summary.warnings.is_empty());

    let rows = read_output(&config.settings.output_filename);
    assert_eq!(render(&rows), vec!["report_id,auditee_name", "0042,Alpha"]);
}

fn api_sources_yaml(server: &MockServer) -> String {
    format!(
        r#"sources:
  - name: general
    kind: paginated-api
    url: {}/general
    api_params:
      auditYear: 2024
    role: primary
    columns: [report_id, auditee_name]
"#,
        server.uri()
    )
}

fn page(records: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "results": records }))
}

async fn mount_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "0"))
        .and(header("x-api-key", "test-key"))
        .respond_with(page(json!([
            { "report_id": "00123", "auditee_name": "Alpha" },
            { "report_id": "00456", "auditee_name": "Beta" }
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "2"))
        .respond_with(page(json!([
            { "report_id": "00789", "auditee_name": "Gamma" }
        ])))
        .mount(server)
        .await;
}

#[tokio::test]
#[serial]
async fn test_paginated_fetch_survives_transient_failure() {
    let clean_server = MockServer::start().await;
    mount_pages(&clean_server).await;

    let flaky_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&flaky_server)
        .await;
    mount_pages(&flaky_server).await;

    std::env::set_var("FAC_IT_RETRY_KEY", "test-key");

    let mut outputs = Vec::new();
    for server in [&clean_server, &flaky_server] {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "{}{}",
            settings_yaml(dir.path(), "FAC_IT_RETRY_KEY"),
            api_sources_yaml(server)
        );
        let config = load(&yaml);

        let summary = pipeline::run(&config, RunProgress::hidden()).await.unwrap();
        assert_eq!(summary.datasets[0].rows_fetched, Some(3));
        outputs.push(read_output(&config.settings.output_filename));
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(
        render(&outputs[1]),
        vec![
            "report_id,auditee_name",
            "00123,Alpha",
            "00456,Beta",
            "00789,Gamma"
        ]
    );
}

#[tokio::test]
#[serial]
async fn test_persistent_failure_is_source_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/general"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    std::env::set_var("FAC_IT_DOWN_KEY", "test-key");
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}{}",
        settings_yaml(dir.path(), "FAC_IT_DOWN_KEY"),
        api_sources_yaml(&server)
    );
    let config = load(&yaml);

    let err = pipeline::run(&config, RunProgress::hidden()).await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable { .. }), "got {:?}", err);
    assert_eq!(err.exit_code(), 4);
    assert!(!config.settings.output_filename.exists());
    assert!(scratch_is_clean(dir.path()));
}

#[tokio::test]
#[serial]
async fn test_missing_credential_fails_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(page(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    std::env::remove_var("FAC_IT_ABSENT_KEY");
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}{}",
        settings_yaml(dir.path(), "FAC_IT_ABSENT_KEY"),
        api_sources_yaml(&server)
    );
    let config = load(&yaml);

    let err = pipeline::run(&config, RunProgress::hidden()).await.unwrap_err();
    assert!(matches!(err, PipelineError::MissingCredential { .. }), "got {:?}", err);
    assert_eq!(err.exit_code(), 3);
    assert!(!dir.path().join("scratch").exists());
}

#[tokio::test]
#[serial]
async fn test_total_count_header_ends_pagination() {
    let server = MockServer::start().await;
    let full_page = |records: serde_json::Value| page(records).insert_header("x-total-count", "4");
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "0"))
        .respond_with(full_page(json!([
            { "report_id": "00123", "auditee_name": "Alpha" },
            { "report_id": "00456", "auditee_name": "Beta" }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "2"))
        .respond_with(full_page(json!([
            { "report_id": "00789", "auditee_name": "Gamma" },
            { "report_id": "01011", "auditee_name": "Delta" }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "4"))
        .respond_with(page(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    std::env::set_var("FAC_IT_TOTAL_KEY", "test-key");
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}{}",
        settings_yaml(dir.path(), "FAC_IT_TOTAL_KEY"),
        api_sources_yaml(&server)
    );
    let config = load(&yaml);

    let summary = pipeline::run(&config, RunProgress::hidden()).await.unwrap();
    assert_eq!(summary.datasets[0].rows_fetched, Some(4));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(read_output(&config.settings.output_filename).len(), 5);
}

#[tokio::test]
#[serial]
async fn test_failed_fetch_leaves_no_spool_in_kept_scratch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "0"))
        .respond_with(page(json!([
            { "report_id": "00123", "auditee_name": "Alpha" },
            { "report_id": "00456", "auditee_name": "Beta" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/general"))
        .and(query_param("from", "2"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    std::env::set_var("FAC_IT_SPOOL_KEY", "test-key");
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "{}  cleanup_temp_files: false\n{}",
        settings_yaml(dir.path(), "FAC_IT_SPOOL_KEY"),
        api_sources_yaml(&server)
    );
    let config = load(&yaml);

    let err = pipeline::run(&config, RunProgress::hidden()).await.unwrap_err();
    assert_eq!(err.exit_code(), 4);

    let runs: Vec<_> = std::fs::read_dir(dir.path().join("scratch"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(runs.len(), 1);
    let left: Vec<_> = std::fs::read_dir(&runs[0])
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(left.is_empty(), "files left in scratch: {:?}", left);
}
