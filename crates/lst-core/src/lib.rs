//! Dataset layout primitives shared by the batch runner and the report
//! aggregation: BIDS identifiers and paths, sorted inventories, and work
//! partitioning.

use std::fs;
use std::path::Path;

pub mod bids;
pub mod inventory;
pub mod partition;

pub use bids::{
    bids_filename, bids_prefix, derivative_path, paired_flair_path, raw_anat_path, session_id,
    subject_id, DerivativeLayout,
};
pub use inventory::{list_files, list_session_dirs, list_subject_dirs, list_t1w_inputs};
pub use partition::partition;

/// Derivatives sub-directory written by the LST-AI pipeline.
pub const DEFAULT_PIPELINE_TAG: &str = "lst-ai-v1.1.0";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("shard count must be at least 1")]
    ZeroShards,
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}
