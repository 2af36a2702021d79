//! Progress indicators for fetch and merge stages
//!
//! Bars draw to stderr and disappear automatically when stderr is not a
//! terminal; `--no-progress` hides them unconditionally.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Shared handle for all bars of one run
#[derive(Clone)]
pub struct RunProgress {
    multi: MultiProgress,
}

impl RunProgress {
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self { multi }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    /// Spinner counting records of a paginated fetch
    pub fn records_spinner(&self, dataset: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(style("{spinner:.green} {prefix:.bold} {human_pos} records {msg}"));
        pb.set_prefix(dataset.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }

    /// Byte counter for a download whose size may be unknown
    pub fn download_bar(&self, dataset: &str, total_bytes: Option<u64>) -> ProgressBar {
        let pb = match total_bytes {
            Some(total) => {
                let pb = self.multi.add(ProgressBar::new(total));
                pb.set_style(
                    style("{prefix:.bold} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                        .progress_chars("#>-"),
                );
                pb
            },
            None => {
                let pb = self.multi.add(ProgressBar::new_spinner());
                pb.set_style(style("{spinner:.green} {prefix:.bold} {bytes} {msg}"));
                pb.enable_steady_tick(Duration::from_millis(120));
                pb
            },
        };
        pb.set_prefix(dataset.to_string());
        pb
    }

    /// Spinner for an indeterminate stage
    pub fn stage_spinner(&self, message: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(style("{spinner:.green} {msg}"));
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
