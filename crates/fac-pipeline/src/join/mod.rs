//! Out-of-core join engine
//!
//! Reconciled datasets are first sorted by join key with [`ExternalSorter`],
//! then merged in a single pass by [`MergeJoin`]. Memory use is bounded by
//! the sort buffer and by the child rows sharing one key.

pub mod merge;
pub mod sort;

pub use merge::{JoinChild, JoinStats, MergeJoin, MergedRow, OutputSchema, SortedDataset};
pub use sort::{ExternalSorter, SortStats, MERGE_FAN_IN};

use crate::error::Result;
use crate::schema::ReconciledDataset;
use std::path::Path;
use tracing::instrument;

/// Sort a reconciled dataset by its join key into `scratch_dir`
#[instrument(skip_all, fields(dataset = %dataset.name))]
pub fn sort_dataset(
    sorter: &ExternalSorter,
    dataset: &ReconciledDataset,
    scratch_dir: &Path,
) -> Result<(SortedDataset, SortStats)> {
    let path = scratch_dir.join(format!("{}.sorted.csv", dataset.name));
    let stats = sorter.sort_file(&dataset.path, dataset.schema.key_index, &dataset.name, &path)?;
    Ok((
        SortedDataset {
            name: dataset.name.clone(),
            path,
            schema: dataset.schema.clone(),
        },
        stats,
    ))
}
