//! Tabular reports over segmentation derivatives.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use lst_core::{bids_filename, list_files, list_t1w_inputs, session_id, subject_id, DerivativeLayout};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub mod table;

pub use table::{cell, Row, StatsTable};

pub const MISSING_REPORT: &str = "lst-ai_cross_missing.csv";
pub const PROCESSED_REPORT: &str = "lst-ai_cross_processed.csv";
pub const LESION_STATS_REPORT: &str = "lst-ai_lesion_stats.csv";
pub const VOLUME_LESION_REPORT: &str = "volume_lesion_stats.csv";
pub const SAMSEG_PIPELINE_TAG: &str = "samseg-longitudinal-7.3.2";

const LESION_MASK_SUFFIX: &str = "space-FLAIR_label-lesion_mask.nii.gz";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedListing {
    pub processed: Vec<(String, String)>,
    pub missing: Vec<(String, String)>,
}

impl ProcessedListing {
    fn table(pairs: &[(String, String)]) -> StatsTable {
        let mut table = StatsTable::with_columns(&["subject-ID", "session-ID"]);
        for (subject, session) in pairs {
            table.push_row(vec![
                cell("subject-ID", subject.as_str()),
                cell("session-ID", session.as_str()),
            ]);
        }
        table
    }

    /// Writes the missing and processed listings into `out_dir`.
    pub fn write(&self, out_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(out_dir)?;
        let missing = out_dir.join(MISSING_REPORT);
        let processed = out_dir.join(PROCESSED_REPORT);
        Self::table(&self.missing).write_csv(&missing)?;
        Self::table(&self.processed).write_csv(&processed)?;
        Ok((missing, processed))
    }
}

/// Lists every raw T1w session as processed (lesion mask present in the
/// derivatives tree) or missing.
pub fn check_processed(dataset_root: &Path, derivatives_dir: &Path) -> ProcessedListing {
    let layout = DerivativeLayout::at(derivatives_dir);
    let mut listing = ProcessedListing::default();
    for t1 in list_t1w_inputs(dataset_root) {
        let subject = subject_id(&t1);
        let session = session_id(&t1);
        if subject.is_empty() || session.is_empty() {
            warn!(path = %t1.display(), "no subject/session identifier, skipped");
            continue;
        }
        if layout.output_file(&subject, &session, LESION_MASK_SUFFIX).exists() {
            info!("{}/{}: processed successfully", subject, session);
            listing.processed.push((subject, session));
        } else {
            info!("{}/{}: segmentation failed", subject, session);
            listing.missing.push((subject, session));
        }
    }
    listing
}

/// Gathers the renamed lesion statistics of every segmented session into one
/// table with leading `sub-ID` and `ses-ID` columns. Rows from the plain lesion
/// table are tagged `Region = WM`.
pub fn collect_lesion_stats(derivatives_dir: &Path) -> StatsTable {
    let layout = DerivativeLayout::at(derivatives_dir);
    let mut out = StatsTable::new();
    for mask in list_files(derivatives_dir, &format!("*{}", LESION_MASK_SUFFIX)) {
        let subject = subject_id(&mask);
        let session = session_id(&mask);
        if subject.is_empty() || session.is_empty() {
            warn!(path = %mask.display(), "no subject/session identifier, skipped");
            continue;
        }
        match session_lesion_stats(&layout, &subject, &session) {
            Ok(table) => {
                out.extend(table);
                info!("sub-{}_ses-{}: stats added", subject, session);
            }
            Err(e) => warn!(subject = %subject, session = %session, error = %format!("{:#}", e), "stats unavailable, skipped"),
        }
    }
    out
}

fn session_lesion_stats(layout: &DerivativeLayout, subject: &str, session: &str) -> Result<StatsTable> {
    let ids = || vec![cell("sub-ID", subject), cell("ses-ID", session)];
    let lesions = StatsTable::read_csv(&layout.output_file(subject, session, "lesion_stats.csv"))?;
    let annotated =
        StatsTable::read_csv(&layout.output_file(subject, session, "annotated_lesion_stats.csv"))?;
    let mut table = StatsTable::new();
    for row in lesions.rows() {
        let mut full = ids();
        full.push(cell("Region", "WM"));
        full.extend(row.iter().filter(|(c, _)| c != "Region").cloned());
        table.push_row(full);
    }
    for row in annotated.rows() {
        let mut full = ids();
        full.extend(row.iter().cloned());
        table.push_row(full);
    }
    Ok(table)
}

/// Reads a SAMSEG `.stats` file: lines `# Measure <ROI>, <volume>, <unit>`.
pub fn read_samseg_stats(path: &Path) -> Result<Vec<(String, String)>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    let mut measures = Vec::new();
    for result in rdr.records() {
        let record = result.with_context(|| format!("malformed line in {}", path.display()))?;
        if record.len() < 2 {
            continue;
        }
        let roi = record[0].trim_start_matches("# Measure ").trim().to_string();
        measures.push((roi, record[1].to_string()));
    }
    Ok(measures)
}

static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>").expect("static tag pattern"));
static PBVC_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"PBVC\s*[:=]?\s*([-+]?\d+(?:\.\d+)?)").expect("static pbvc pattern")
});

/// Percentage brain volume change reported in a SIENA style HTML report: the
/// last number directly following `PBVC` once markup is removed.
pub fn parse_pbvc(html: &str) -> Option<f64> {
    let text = HTML_TAG.replace_all(html, " ");
    PBVC_VALUE
        .captures_iter(&text)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}

fn session_volume_row(layout: &DerivativeLayout, subject: &str, session: &str) -> Result<Row> {
    let anat = layout.anat_dir(subject, session);
    let mut row = vec![cell("sub-ID", subject), cell("ses-ID", session)];
    for suffix in ["samseg.stats", "sbtiv.stats"] {
        let path = anat.join(bids_filename(subject, session, suffix));
        row.extend(read_samseg_stats(&path)?);
    }
    Ok(row)
}

fn with_timepoint(row: &Row, label: &str) -> Row {
    row.iter()
        .filter(|(c, _)| c != "sub-ID")
        .map(|(c, v)| (format!("{}.{}", c, label), v.clone()))
        .collect()
}

/// Builds the flattened longitudinal table of a SAMSEG derivatives tree: the
/// earliest and latest session of each subject side by side (`.t1`/`.t2`),
/// joined with the subject's longitudinal lesion rows and its PBVC.
pub fn longitudinal_volume_stats(derivatives_dir: &Path) -> StatsTable {
    let layout = DerivativeLayout::at(derivatives_dir);
    let mut sessions: BTreeMap<String, Vec<(String, Row)>> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for seg in list_files(derivatives_dir, "*_seg.mgz") {
        let subject = subject_id(&seg);
        let session = session_id(&seg);
        if subject.is_empty() || session.is_empty() {
            warn!(path = %seg.display(), "no subject/session identifier, skipped");
            continue;
        }
        match session_volume_row(&layout, &subject, &session) {
            Ok(row) => {
                if !sessions.contains_key(&subject) {
                    order.push(subject.clone());
                }
                sessions.entry(subject).or_default().push((session, row));
            }
            Err(e) => warn!(subject = %subject, session = %session, error = %format!("{:#}", e), "volume stats unavailable, skipped"),
        }
    }

    let mut out = StatsTable::new();
    for subject in order {
        let rows = match sessions.get(&subject) {
            Some(rows) if !rows.is_empty() => rows,
            _ => continue,
        };
        let first = rows.iter().min_by(|a, b| a.0.cmp(&b.0)).map(|(_, r)| r);
        let last = rows.iter().max_by(|a, b| a.0.cmp(&b.0)).map(|(_, r)| r);
        let (first, last) = match (first, last) {
            (Some(f), Some(l)) => (f, l),
            _ => continue,
        };
        let mut flat = vec![cell("sub-ID", subject.as_str())];
        flat.extend(with_timepoint(first, "t1"));
        flat.extend(with_timepoint(last, "t2"));

        let subject_dir = layout.subject_dir(&subject);
        let lesion_path = subject_dir.join(format!("sub-{}_longi_lesions.csv", subject));
        let lesions = match StatsTable::read_csv(&lesion_path) {
            Ok(t) => t,
            Err(e) => {
                warn!(subject = %subject, error = %format!("{:#}", e), "longitudinal lesions unavailable, skipped");
                continue;
            }
        };
        let report = subject_dir.join(format!("sub-{}_PBVC-report.html", subject));
        let pbvc = fs::read_to_string(&report).ok().and_then(|html| parse_pbvc(&html));
        if pbvc.is_none() {
            warn!(subject = %subject, "no PBVC value found in {}", report.display());
        }
        let pbvc = pbvc.map(|v| v.to_string()).unwrap_or_default();

        for lesion in lesions.rows() {
            let mut row = flat.clone();
            row.extend(lesion.iter().filter(|(c, _)| c != "sub-ID").cloned());
            row.push(cell("pbvc", pbvc.as_str()));
            out.push_row(row);
        }
    }
    out
}
