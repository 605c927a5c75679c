//! Dataset inventory: sorted, recursive file listings.

use crate::bids::is_subject_segment;
use glob::Pattern;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const T1W_PATTERN: &str = "*T1w*";
pub const NIFTI_GZ: &str = ".nii.gz";

/// Every file below `root` whose file name matches the glob `pattern`,
/// lexicographically sorted. A missing root yields an empty list.
pub fn list_files(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let pattern = match Pattern::new(pattern) {
        Ok(p) => p,
        Err(e) => {
            debug!(pattern, error = %e, "invalid file pattern");
            return Vec::new();
        }
    };
    if !root.exists() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|name| pattern.matches(name))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Immediate children of `root` that are subject directories (`sub-<id>`).
pub fn list_subject_dirs(root: &Path) -> Vec<PathBuf> {
    list_child_dirs(root, is_subject_segment)
}

fn list_child_dirs(root: &Path, keep: fn(&str) -> bool) -> Vec<PathBuf> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %root.display(), error = %e, "cannot list directory");
            return Vec::new();
        }
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| p.file_name().and_then(|s| s.to_str()).map(keep).unwrap_or(false))
        .collect();
    dirs.sort();
    dirs
}

/// Immediate children of a subject directory that are session directories.
pub fn list_session_dirs(subject_dir: &Path) -> Vec<PathBuf> {
    list_child_dirs(subject_dir, crate::bids::is_session_segment)
}

/// T1-weighted NIfTI inputs under `root`: derivatives and gadolinium
/// enhanced acquisitions are excluded.
pub fn list_t1w_inputs(root: &Path) -> Vec<PathBuf> {
    list_files(root, T1W_PATTERN)
        .into_iter()
        .filter(|p| is_raw_nifti_input(p, root))
        .collect()
}

fn is_raw_nifti_input(path: &Path, root: &Path) -> bool {
    let name = match path.file_name().and_then(|s| s.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if !name.ends_with(NIFTI_GZ) || name.contains("GADOLINIUM") {
        return false;
    }
    let rel = path.strip_prefix(root).unwrap_or(path);
    !rel.components().any(|c| c.as_os_str() == "derivatives")
}
