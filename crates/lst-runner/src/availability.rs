//! Which subjects still have processable, unsegmented sessions.
//!
//! The check only looks at file existence and never writes, so running it
//! repeatedly between batches is safe; the missing set can only shrink as
//! segmentations succeed.

use lst_core::{
    bids_filename, list_session_dirs, session_id, subject_id, DerivativeLayout,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const LESION_MASK_SUFFIX: &str = "space-FLAIR_label-lesion_mask.nii.gz";
pub const ANNOTATED_LESION_MASK_SUFFIX: &str =
    "space-FLAIR_desc-annotated_label-lesion_mask.nii.gz";
pub const T1W_SUFFIX: &str = "T1w.nii.gz";
pub const FLAIR_SUFFIX: &str = "FLAIR.nii.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Inputs present, output absent.
    Missing,
    /// Output present.
    Complete,
    /// Output absent and at least one input absent.
    NotProcessable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub missing: Vec<PathBuf>,
    pub complete: Vec<PathBuf>,
}

/// Status of one session directory `<subject_dir>/ses-<id>`.
pub fn session_status(
    subject_dir: &Path,
    subject: &str,
    session: &str,
    layout: &DerivativeLayout,
    output_suffix: &str,
) -> SessionStatus {
    if layout.output_file(subject, session, output_suffix).exists() {
        return SessionStatus::Complete;
    }
    let anat = subject_dir.join(format!("ses-{}", session)).join("anat");
    let t1 = anat.join(bids_filename(subject, session, T1W_SUFFIX));
    let flair = anat.join(bids_filename(subject, session, FLAIR_SUFFIX));
    if t1.exists() && flair.exists() {
        SessionStatus::Missing
    } else {
        SessionStatus::NotProcessable
    }
}

/// Splits `subject_dirs` into subjects with at least one missing session and
/// subjects with none. Order within each list follows the input order.
pub fn check_availability(
    subject_dirs: &[PathBuf],
    derivatives_dir: &Path,
    output_suffix: &str,
) -> Availability {
    let layout = DerivativeLayout::at(derivatives_dir);
    let mut availability = Availability::default();
    for subject_dir in subject_dirs {
        let subject = subject_id(subject_dir);
        if subject.is_empty() {
            warn!(dir = %subject_dir.display(), "no subject identifier in path, nothing to process");
            availability.complete.push(subject_dir.clone());
            continue;
        }
        let mut any_missing = false;
        for session_dir in list_session_dirs(subject_dir) {
            let session = session_id(&session_dir);
            if session.is_empty() {
                continue;
            }
            let status = session_status(subject_dir, &subject, &session, &layout, output_suffix);
            debug!(subject = %subject, session = %session, status = ?status, "session availability");
            if status == SessionStatus::Missing {
                any_missing = true;
            }
        }
        if any_missing {
            availability.missing.push(subject_dir.clone());
        } else {
            availability.complete.push(subject_dir.clone());
        }
    }
    availability
}
