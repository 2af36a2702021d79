//! FAC Pipeline Library
//!
//! Fetches related tabular datasets from the Federal Audit Clearinghouse (or
//! any API / file source described in configuration) and merges them into one
//! gzip-compressed CSV keyed by a shared identifier.
//!
//! # Stages
//!
//! - **Source adapters** ([`source`]): paginated JSON API, bulk download or
//!   local file, each materialized as a delimited file in scratch
//! - **Schema reconciler** ([`schema`]): header matching, key normalization,
//!   dropped-row accounting
//! - **Join engine** ([`join`]): external sort plus sort-merge left-outer join
//!   with per-child expand/aggregate policy
//! - **Output writer** ([`output`]): streamed gzip CSV, renamed into place
//!
//! # Example
//!
//! ```no_run
//! use fac_pipeline::{config::PipelineConfig, pipeline, progress::RunProgress};
//!
//! #[tokio::main]
//! async fn main() -> fac_pipeline::Result<()> {
//!     let config = PipelineConfig::load("pipeline.yml")?;
//!     let summary = pipeline::run(&config, RunProgress::hidden()).await?;
//!     println!("{}", summary.render_text());
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! settings:
//!   output_filename: fac_merged.csv.gz
//!   download_directory: ./downloads
//!   primary_join_key: report_id
//! sources:
//!   - name: general
//!     kind: paginated-api
//!     url: https://api.sam.gov/data-services/v3/fac/single_audits/general
//!     api_params: { auditYear: 2024 }
//!     role: primary
//!   - name: findings
//!     kind: paginated-api
//!     url: https://api.sam.gov/data-services/v3/fac/single_audits/findings
//!     role: child
//!     multiplicity: { policy: expand }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod join;
pub mod output;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod schema;
pub mod source;
pub mod summary;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use summary::RunSummary;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// FAC Pipeline - fetch and merge audit datasets
#[derive(Parser, Debug)]
#[command(name = "fac-pipeline")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to ./logs/fac-pipeline.<date>
    #[arg(long, global = true)]
    pub log_file: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch every dataset and write the merged output
    Run {
        /// Pipeline configuration file
        #[arg(short, long, env = "FAC_CONFIG", default_value = "pipeline.yml")]
        config: PathBuf,

        /// Override settings.output_filename
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override settings.download_directory
        #[arg(long)]
        scratch_dir: Option<PathBuf>,

        /// Keep the run's scratch directory
        #[arg(long)]
        keep_scratch: bool,

        /// Hide progress bars
        #[arg(long)]
        no_progress: bool,

        /// Also write the run summary as JSON
        #[arg(long)]
        summary_json: Option<PathBuf>,
    },

    /// Check the configuration without touching network or disk
    Validate {
        /// Pipeline configuration file
        #[arg(short, long, env = "FAC_CONFIG", default_value = "pipeline.yml")]
        config: PathBuf,
    },

    /// Request one record from every paginated endpoint
    Probe {
        /// Pipeline configuration file
        #[arg(short, long, env = "FAC_CONFIG", default_value = "pipeline.yml")]
        config: PathBuf,
    },
}
