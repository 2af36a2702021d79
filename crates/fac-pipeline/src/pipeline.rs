//! Run orchestration
//!
//! ```text
//! credentials -> fetch (concurrent) -> reconcile -> sort -> join -> write
//! ```
//!
//! Fetching runs on the async runtime with bounded concurrency. Everything
//! after it is CPU and disk bound and runs on one blocking worker. The run's
//! scratch directory lives exactly as long as [`run`].

use crate::config::{DatasetRole, MultiplicityPolicy, PipelineConfig};
use crate::context::{DiagnosticKind, Diagnostics, RunContext, Stage};
use crate::credentials::resolve_credential;
use crate::error::{PipelineError, Result};
use crate::join::{self, ExternalSorter, JoinChild, JoinStats, MergeJoin, OutputSchema};
use crate::output::{write_merged, OutputArtifact};
use crate::progress::RunProgress;
use crate::schema::{reconcile, ReconciledDataset};
use crate::source::{fetch_all, http::build_client, FetchEnv, RawDataset};
use crate::summary::{DatasetSummary, RunSummary};
use chrono::Utc;
use std::path::Path;
use tracing::{info, instrument};

/// Results of the blocking merge stage
struct MergeOutcome {
    reconciled: Vec<ReconciledDataset>,
    artifact: OutputArtifact,
    stats: JoinStats,
    diagnostics: Diagnostics,
}

/// Execute one full run
///
/// Fails with [`PipelineError::MissingCredential`] before any network
/// activity when a remote source has no key.
#[instrument(skip_all, fields(output = %config.settings.output_filename.display()))]
pub async fn run(config: &PipelineConfig, progress: RunProgress) -> Result<RunSummary> {
    let settings = &config.settings;
    let api_key = resolve_credential(config)?;

    let mut ctx = RunContext::start(&settings.download_directory, settings.cleanup_temp_files)?;
    info!(
        run_id = %ctx.run_id,
        datasets = config.sources.len(),
        scratch = %ctx.scratch.path().display(),
        "Run started"
    );

    let env = FetchEnv {
        client: build_client(settings.request_timeout())?,
        api_key,
        retry: settings.retry_policy(),
        default_page_size: settings.api_page_size,
        join_key: settings.primary_join_key.clone(),
        scratch_dir: ctx.scratch.path().to_path_buf(),
        max_concurrent: settings.max_concurrent_fetches,
        progress: progress.clone(),
    };
    let raws = fetch_all(&config.sources, &env).await?;
    info!(datasets = raws.len(), "All datasets fetched");

    let spinner = progress.stage_spinner("Merging datasets");
    let merge_config = config.clone();
    let merge_raws = raws.clone();
    let scratch_dir = ctx.scratch.path().to_path_buf();
    let diagnostics = std::mem::take(&mut ctx.diagnostics);
    let outcome = tokio::task::spawn_blocking(move || {
        merge_stage(&merge_config, &merge_raws, &scratch_dir, diagnostics)
    })
    .await;
    spinner.finish_and_clear();
    let outcome = outcome??;
    ctx.diagnostics = outcome.diagnostics;

    let datasets = config
        .sources
        .iter()
        .zip(&raws)
        .zip(&outcome.reconciled)
        .map(|((spec, raw), reconciled)| DatasetSummary::new(spec, raw, reconciled))
        .collect();

    let summary = RunSummary {
        run_id: ctx.run_id,
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        datasets,
        primary_rows: outcome.stats.primary_rows,
        merged_rows: outcome.stats.rows_out,
        output: outcome.artifact,
        warnings: ctx.diagnostics.entries().to_vec(),
    };
    info!(
        run_id = %summary.run_id,
        merged_rows = summary.merged_rows,
        warnings = summary.warnings.len(),
        duration_secs = summary.duration_secs(),
        "Run finished"
    );
    Ok(summary)
}

/// Reconcile, sort, join and write on the current thread
fn merge_stage(
    config: &PipelineConfig,
    raws: &[RawDataset],
    scratch_dir: &Path,
    mut diagnostics: Diagnostics,
) -> Result<MergeOutcome> {
    let settings = &config.settings;
    let join_key = settings.primary_join_key.as_str();

    let mut reconciled = Vec::with_capacity(raws.len());
    for (spec, raw) in config.sources.iter().zip(raws) {
        let target = scratch_dir.join(format!("{}.csv", spec.name));
        reconciled.push(reconcile(raw, spec, join_key, &target, &mut diagnostics)?);
    }
    // Every dataset is checked before anything is written
    let reconciled = reconciled
        .into_iter()
        .map(ReconciledDataset::into_valid)
        .collect::<Result<Vec<_>>>()?;

    let sorter = ExternalSorter::new(scratch_dir, settings.sort_buffer_rows);
    let mut primary = None;
    let mut children = Vec::new();
    for (spec, dataset) in config.sources.iter().zip(&reconciled) {
        let (sorted, stats) = join::sort_dataset(&sorter, dataset, scratch_dir)?;
        info!(dataset = %spec.name, rows = stats.rows, runs = stats.runs, "Sorted dataset");
        match spec.role {
            DatasetRole::Primary => primary = Some(sorted),
            DatasetRole::Child => children.push(JoinChild {
                dataset: sorted,
                prefix: spec.prefix(),
                policy: spec
                    .multiplicity
                    .clone()
                    .unwrap_or(MultiplicityPolicy::Expand),
            }),
        }
    }
    let primary = primary.ok_or_else(|| PipelineError::config("no primary source configured"))?;

    let schema = OutputSchema::build(&primary.schema, &children);
    for (from, to) in &schema.renamed {
        diagnostics.record(
            Stage::Join,
            None,
            DiagnosticKind::RenamedOutputColumn {
                from: from.clone(),
                to: to.clone(),
            },
        );
    }

    let mut merge = MergeJoin::open(&primary, &children)?;
    let artifact = write_merged(&settings.output_filename, &schema.columns, merge.by_ref())?;
    let stats = merge.stats().clone();

    if stats.duplicate_keys > 0 {
        diagnostics.record(
            Stage::Join,
            Some(&primary.name),
            DiagnosticKind::DuplicatePrimaryKeys {
                distinct_keys: stats.duplicate_keys,
                extra_rows: stats.duplicate_rows,
            },
        );
    }
    for (child, count) in &stats.unmatched {
        if *count > 0 {
            diagnostics.record(
                Stage::Join,
                Some(child),
                DiagnosticKind::UnmatchedChildRows { count: *count },
            );
        }
    }

    Ok(MergeOutcome {
        reconciled,
        artifact,
        stats,
        diagnostics,
    })
}
