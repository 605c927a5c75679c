//! BIDS identifiers and canonical paths.
//!
//! Identifiers are read from path segments by splitting every segment into
//! `_`-separated entities and matching an entity that *starts* with the
//! marker. Segments are visited from the file name back towards the root, so
//! the identifier closest to the file wins over anything in an ancestor
//! directory.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

pub const SUBJECT_MARKER: &str = "sub-";
pub const SESSION_MARKER: &str = "ses-";

/// Placeholder the segmentation tool writes into auxiliary file names.
pub const AUX_PLACEHOLDER: &str = "sub-X_ses-Y";

static SUBJECT_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sub-([a-zA-Z0-9]+)$").expect("static subject pattern"));
static SESSION_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ses-(\d{8})$").expect("static session pattern"));

/// Subject identifier of `path`, or an empty string when no segment carries a
/// well-formed `sub-<alnum>` entity.
pub fn subject_id(path: &Path) -> String {
    find_entity(path, SUBJECT_MARKER, &SUBJECT_ENTITY).unwrap_or_default()
}

/// Session identifier (exactly eight digits) of `path`, or an empty string.
pub fn session_id(path: &Path) -> String {
    find_entity(path, SESSION_MARKER, &SESSION_ENTITY).unwrap_or_default()
}

fn find_entity(path: &Path, marker: &str, pattern: &Regex) -> Option<String> {
    let segments: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    for segment in segments.iter().rev() {
        for entity in segment_entities(segment) {
            if !entity.starts_with(marker) {
                continue;
            }
            if let Some(caps) = pattern.captures(entity) {
                return Some(caps[1].to_string());
            }
        }
    }
    None
}

fn segment_entities(segment: &str) -> impl Iterator<Item = &str> {
    let stem = segment.split('.').next().unwrap_or(segment);
    stem.split('_').filter(|e| !e.is_empty())
}

/// `true` when a directory name is exactly a subject entity (`sub-001`).
pub fn is_subject_segment(name: &str) -> bool {
    SUBJECT_ENTITY.is_match(name)
}

/// `true` when a directory name is exactly a session entity (`ses-20200101`).
pub fn is_session_segment(name: &str) -> bool {
    SESSION_ENTITY.is_match(name)
}

pub fn bids_prefix(subject: &str, session: &str) -> String {
    format!("sub-{}_ses-{}", subject, session)
}

pub fn bids_filename(subject: &str, session: &str, suffix: &str) -> String {
    format!("{}_{}", bids_prefix(subject, session), suffix)
}

/// `<root>/derivatives/<tag>/sub-<s>/ses-<e>/<modality>/<filename>`. No I/O.
pub fn derivative_path(
    root: &Path,
    pipeline_tag: &str,
    subject: &str,
    session: &str,
    modality: &str,
    filename: &str,
) -> PathBuf {
    DerivativeLayout::new(root, pipeline_tag)
        .session_dir(subject, session)
        .join(modality)
        .join(filename)
}

/// `<root>/sub-<s>/ses-<e>/anat/sub-<s>_ses-<e>_<suffix>`.
pub fn raw_anat_path(root: &Path, subject: &str, session: &str, suffix: &str) -> PathBuf {
    root.join(format!("sub-{}", subject))
        .join(format!("ses-{}", session))
        .join("anat")
        .join(bids_filename(subject, session, suffix))
}

/// FLAIR image paired with a T1-weighted image by file name substitution.
/// `None` when the file name does not end in `_T1w.nii.gz`.
pub fn paired_flair_path(t1: &Path) -> Option<PathBuf> {
    let name = t1.file_name()?.to_str()?;
    let stem = name.strip_suffix("_T1w.nii.gz")?;
    Some(t1.with_file_name(format!("{}_FLAIR.nii.gz", stem)))
}

/// Derivatives tree of one pipeline: `<root>/derivatives/<tag>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeLayout {
    root: PathBuf,
}

impl DerivativeLayout {
    pub fn new(dataset_root: &Path, pipeline_tag: &str) -> Self {
        Self {
            root: dataset_root.join("derivatives").join(pipeline_tag),
        }
    }

    /// Wraps an already resolved derivatives directory.
    pub fn at(derivatives_dir: &Path) -> Self {
        Self {
            root: derivatives_dir.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(format!("sub-{}", subject))
    }

    pub fn session_dir(&self, subject: &str, session: &str) -> PathBuf {
        self.subject_dir(subject).join(format!("ses-{}", session))
    }

    pub fn anat_dir(&self, subject: &str, session: &str) -> PathBuf {
        self.session_dir(subject, session).join("anat")
    }

    pub fn temp_dir(&self, subject: &str, session: &str) -> PathBuf {
        self.session_dir(subject, session).join("temp")
    }

    /// A BIDS-named file inside the session's `anat` directory.
    pub fn output_file(&self, subject: &str, session: &str, suffix: &str) -> PathBuf {
        self.anat_dir(subject, session)
            .join(bids_filename(subject, session, suffix))
    }
}
