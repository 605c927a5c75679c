//! Per-session segmentation: input check, skip, tool run, BIDS renaming and
//! teardown of failed derivative trees.

use crate::availability::{ANNOTATED_LESION_MASK_SUFFIX, LESION_MASK_SUFFIX};
use crate::config::{Clipping, Device, PipelineConfig};
use crate::tool::{
    SegmentationTool, ToolExit, ToolInvocation, RAW_ANNOTATED_LESION_STATS, RAW_LESION_STATS,
    SENTINEL_ANNOTATED_MASK, SENTINEL_MASK,
};
use lst_core::bids::AUX_PLACEHOLDER;
use lst_core::{
    bids_prefix, ensure_dir, list_t1w_inputs, paired_flair_path, session_id, subject_id,
    DerivativeLayout,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, info_span, warn};

pub const LESION_STATS_SUFFIX: &str = "lesion_stats.csv";
pub const ANNOTATED_LESION_STATS_SUFFIX: &str = "annotated_lesion_stats.csv";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no subject/session identifier in {}", .path.display())]
    MissingIdentifier { path: PathBuf },
    #[error("FLAIR image not available: {}", .flair.display())]
    MissingFlair { flair: PathBuf },
    #[error("segmentation failed (exit {exit}, missing outputs: {missing:?})")]
    ToolFailed {
        exit: String,
        missing: Vec<&'static str>,
    },
    #[error("segmentation tool could not be run: {0:#}")]
    Tool(anyhow::Error),
    #[error("failed to delete derivative tree {}: {} path(s) still present", .dir.display(), .remaining.len())]
    Reconciliation {
        dir: PathBuf,
        remaining: Vec<PathBuf>,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Only an incomplete teardown leaves the derivative tree in a state that
    /// later availability checks could misread.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Reconciliation { .. })
    }

    fn io(context: impl Into<String>, source: io::Error) -> Self {
        SessionError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SessionOutcome {
    Segmented,
    SkippedExisting,
    Recoverable(String),
    Fatal(String),
}

impl SessionOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionOutcome::Fatal(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub subject: String,
    pub session: String,
    pub t1: PathBuf,
    pub outcome: SessionOutcome,
}

/// Drives the sessions of the subjects assigned to one worker.
pub struct RunDriver<'a> {
    layout: DerivativeLayout,
    device: Device,
    clipping: Clipping,
    remove_temp: bool,
    tool: &'a dyn SegmentationTool,
    remove_tree: fn(&Path) -> io::Result<()>,
}

impl<'a> RunDriver<'a> {
    pub fn new(config: &PipelineConfig, tool: &'a dyn SegmentationTool) -> Self {
        Self {
            layout: config.layout(),
            device: config.device,
            clipping: config.clipping,
            remove_temp: config.remove_temp,
            tool,
            remove_tree: |dir| fs::remove_dir_all(dir),
        }
    }

    pub fn layout(&self) -> &DerivativeLayout {
        &self.layout
    }

    /// Processes every T1-weighted session of `subject_dir` in order. A failing
    /// session never stops its siblings.
    pub fn process_subject(&self, subject_dir: &Path) -> Vec<SessionReport> {
        let t1w = list_t1w_inputs(subject_dir);
        if t1w.is_empty() {
            info!(dir = %subject_dir.display(), "no T1w images, nothing to segment");
        }
        t1w.iter().map(|t1| self.process_session(t1)).collect()
    }

    pub fn process_session(&self, t1: &Path) -> SessionReport {
        let subject = subject_id(t1);
        let session = session_id(t1);
        let span = info_span!("session", subject = %subject, session = %session);
        let _enter = span.enter();

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.drive(t1, &subject, &session)));
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.failure_outcome(e),
            Err(payload) => {
                let reason = format!("panicked: {}", panic_message(payload.as_ref()));
                warn!(reason = %reason, "session panicked, deleting output folder");
                if subject.is_empty() || session.is_empty() {
                    SessionOutcome::Recoverable(reason)
                } else {
                    match self.discard_session_tree(&subject, &session) {
                        Ok(()) => SessionOutcome::Recoverable(reason),
                        Err(e) => self.failure_outcome(e),
                    }
                }
            }
        };
        SessionReport {
            subject,
            session,
            t1: t1.to_path_buf(),
            outcome,
        }
    }

    fn failure_outcome(&self, e: SessionError) -> SessionOutcome {
        if e.is_fatal() {
            error!(error = %e, "derivative tree left in an inconsistent state");
            SessionOutcome::Fatal(e.to_string())
        } else {
            warn!(error = %e, "error during processing, proceeding with next case");
            SessionOutcome::Recoverable(e.to_string())
        }
    }

    fn drive(&self, t1: &Path, subject: &str, session: &str) -> Result<SessionOutcome, SessionError> {
        if subject.is_empty() || session.is_empty() {
            return Err(SessionError::MissingIdentifier {
                path: t1.to_path_buf(),
            });
        }
        let flair = paired_flair_path(t1).ok_or_else(|| SessionError::MissingIdentifier {
            path: t1.to_path_buf(),
        })?;
        if !flair.exists() {
            return Err(SessionError::MissingFlair { flair });
        }

        let seg_file = self.layout.output_file(subject, session, LESION_MASK_SUFFIX);
        let seg_annotated = self
            .layout
            .output_file(subject, session, ANNOTATED_LESION_MASK_SUFFIX);
        if seg_file.exists() && seg_annotated.exists() {
            info!("lesion segmentation already exists, skip and proceed to next case");
            return Ok(SessionOutcome::SkippedExisting);
        }

        let anat_dir = self.layout.anat_dir(subject, session);
        let temp_dir = self.layout.temp_dir(subject, session);
        ensure_dir(&anat_dir).map_err(|e| SessionError::io("create anat directory", e))?;
        ensure_dir(&temp_dir).map_err(|e| SessionError::io("create temp directory", e))?;

        let invocation = ToolInvocation {
            t1: t1.to_path_buf(),
            flair,
            output_dir: anat_dir.clone(),
            temp_dir: (!self.remove_temp).then(|| temp_dir.clone()),
            device: self.device,
            clipping: self.clipping,
        };
        info!(args = ?invocation.args(), "running lesion segmentation");
        let exit = match self.tool.run(&invocation) {
            Ok(exit) => exit,
            Err(e) => {
                self.discard_session_tree(subject, session)?;
                return Err(SessionError::Tool(e));
            }
        };

        let missing = missing_sentinels(&anat_dir)?;
        if !exit.is_success() || !missing.is_empty() {
            warn!(
                exit = %exit.describe(),
                missing = ?missing,
                "failed to generate segmentation, deleting output folder"
            );
            self.discard_session_tree(subject, session)?;
            return Err(tool_failure(exit, missing));
        }

        info!("renaming lesion masks (BIDS)");
        rename(&anat_dir.join(SENTINEL_MASK), &seg_file)?;
        rename(&anat_dir.join(SENTINEL_ANNOTATED_MASK), &seg_annotated)?;
        for (raw, suffix) in [
            (RAW_LESION_STATS, LESION_STATS_SUFFIX),
            (RAW_ANNOTATED_LESION_STATS, ANNOTATED_LESION_STATS_SUFFIX),
        ] {
            let src = anat_dir.join(raw);
            if src.exists() {
                rename(&src, &self.layout.output_file(subject, session, suffix))?;
            } else {
                warn!(file = raw, "statistics table not produced by the tool");
            }
        }

        if self.remove_temp {
            match fs::remove_dir_all(&temp_dir) {
                Ok(()) => debug!("removed temp directory"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "failed to remove temp directory"),
            }
        } else {
            let renamed = rename_auxiliary_files(&temp_dir, &bids_prefix(subject, session))?;
            if renamed > 0 {
                info!(files = renamed, "renamed auxiliary files (BIDS)");
            }
        }
        Ok(SessionOutcome::Segmented)
    }

    /// Removes `sub-<s>/ses-<e>` from the derivatives tree, and the subject
    /// directory when nothing else is left in it, then checks that neither the
    /// `anat` nor the `temp` directory survived.
    fn discard_session_tree(&self, subject: &str, session: &str) -> Result<(), SessionError> {
        let session_dir = self.layout.session_dir(subject, session);
        if let Err(e) = (self.remove_tree)(&session_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %session_dir.display(), error = %e, "removing derivative tree failed");
            }
        }
        let subject_dir = self.layout.subject_dir(subject);
        let subject_empty = fs::read_dir(&subject_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if subject_empty {
            if let Err(e) = fs::remove_dir(&subject_dir) {
                debug!(dir = %subject_dir.display(), error = %e, "subject directory not removed");
            }
        }
        verify_removed(
            &session_dir,
            &[
                self.layout.anat_dir(subject, session),
                self.layout.temp_dir(subject, session),
            ],
        )?;
        info!("successfully deleted the derivatives folder(s)");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn tool_failure(exit: ToolExit, missing: Vec<&'static str>) -> SessionError {
    SessionError::ToolFailed {
        exit: exit.describe(),
        missing,
    }
}

fn missing_sentinels(anat_dir: &Path) -> Result<Vec<&'static str>, SessionError> {
    let listing: BTreeSet<String> = fs::read_dir(anat_dir)
        .map_err(|e| SessionError::io("list output directory", e))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    Ok([SENTINEL_MASK, SENTINEL_ANNOTATED_MASK]
        .into_iter()
        .filter(|name| !listing.contains(*name))
        .collect())
}

fn verify_removed(dir: &Path, paths: &[PathBuf]) -> Result<(), SessionError> {
    let remaining: Vec<PathBuf> = paths.iter().filter(|p| p.exists()).cloned().collect();
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(SessionError::Reconciliation {
            dir: dir.to_path_buf(),
            remaining,
        })
    }
}

fn rename(from: &Path, to: &Path) -> Result<(), SessionError> {
    fs::rename(from, to).map_err(|e| {
        SessionError::io(
            format!("rename {} -> {}", from.display(), to.display()),
            e,
        )
    })
}

/// BIDS name for an auxiliary file written by the tool, or `None` when the
/// file already carries the session prefix.
pub fn auxiliary_file_name(file_name: &str, prefix: &str) -> Option<String> {
    if file_name.contains(AUX_PLACEHOLDER) {
        Some(file_name.replace(AUX_PLACEHOLDER, prefix))
    } else if file_name.starts_with(prefix) {
        None
    } else {
        Some(format!("{}_{}", prefix, file_name))
    }
}

fn rename_auxiliary_files(temp_dir: &Path, prefix: &str) -> Result<usize, SessionError> {
    let entries = match fs::read_dir(temp_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SessionError::io("list temp directory", e)),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    names.sort();
    let mut renamed = 0;
    for name in names {
        if let Some(target) = auxiliary_file_name(&name, prefix) {
            rename(&temp_dir.join(&name), &temp_dir.join(target))?;
            renamed += 1;
        }
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::{check_availability, FLAIR_SUFFIX, T1W_SUFFIX};
    use anyhow::Result;
    use chrono::Utc;
    use lst_core::raw_anat_path;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Success,
        OnlyMask,
        NonZeroExit,
        SpawnError,
        Panic,
    }

    struct FakeTool {
        behavior: Behavior,
        calls: Mutex<Vec<ToolInvocation>>,
    }

    impl FakeTool {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("calls").len()
        }
    }

    impl SegmentationTool for FakeTool {
        fn run(&self, invocation: &ToolInvocation) -> Result<ToolExit> {
            self.calls.lock().expect("calls").push(invocation.clone());
            if let Behavior::SpawnError = self.behavior {
                return Err(anyhow::anyhow!("No such file or directory (os error 2)"));
            }
            let out = &invocation.output_dir;
            fs::write(out.join(SENTINEL_MASK), b"mask")?;
            match self.behavior {
                Behavior::OnlyMask => return Ok(ToolExit::success()),
                Behavior::Panic => panic!("model weights not found"),
                _ => {}
            }
            fs::write(out.join(SENTINEL_ANNOTATED_MASK), b"annotated")?;
            fs::write(out.join(RAW_LESION_STATS), b"Num_Lesions,Lesion_Volume\n3,1.5\n")?;
            fs::write(out.join(RAW_ANNOTATED_LESION_STATS), b"Region,Num_Lesions\nPeriventricular,2\n")?;
            if let Some(temp) = &invocation.temp_dir {
                fs::write(temp.join("sub-X_ses-Y_space-flair_T1w.nii.gz"), b"aux")?;
                fs::write(temp.join("brainmask.nii.gz"), b"aux")?;
            }
            match self.behavior {
                Behavior::NonZeroExit => Ok(ToolExit { code: Some(1) }),
                _ => Ok(ToolExit::success()),
            }
        }
    }

    /// Sorted list of every path under `root` with its size.
    fn snapshot(root: &Path) -> Vec<(PathBuf, u64)> {
        let mut out = Vec::new();
        collect_entries(root, &mut out);
        out.sort();
        out
    }

    fn collect_entries(dir: &Path, out: &mut Vec<(PathBuf, u64)>) {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                out.push((path.clone(), len));
                if path.is_dir() {
                    collect_entries(&path, out);
                }
            }
        }
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "lst_driver_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    fn raw_session(root: &Path, sub: &str, ses: &str, flair: bool) -> PathBuf {
        let t1 = raw_anat_path(root, sub, ses, T1W_SUFFIX);
        fs::create_dir_all(t1.parent().expect("anat")).expect("anat");
        fs::write(&t1, b"t1").expect("t1");
        if flair {
            fs::write(raw_anat_path(root, sub, ses, FLAIR_SUFFIX), b"flair").expect("flair");
        }
        t1
    }

    fn config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::new(root);
        config.workers = 1;
        config.device = Device::Cpu;
        config
    }

    #[test]
    fn successful_run_renames_outputs_into_bids_layout() {
        let root = temp_root("success");
        let t1 = raw_session(&root, "001", "20200101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::Success);
        let driver = RunDriver::new(&config, &tool);

        let report = driver.process_session(&t1);
        assert_eq!(report.outcome, SessionOutcome::Segmented);
        assert_eq!(report.subject, "001");
        assert_eq!(report.session, "20200101");

        let anat = root.join("derivatives/lst-ai-v1.1.0/sub-001/ses-20200101/anat");
        for name in [
            "sub-001_ses-20200101_space-FLAIR_label-lesion_mask.nii.gz",
            "sub-001_ses-20200101_space-FLAIR_desc-annotated_label-lesion_mask.nii.gz",
            "sub-001_ses-20200101_lesion_stats.csv",
            "sub-001_ses-20200101_annotated_lesion_stats.csv",
        ] {
            assert!(anat.join(name).exists(), "missing {}", name);
        }
        assert!(!anat.join(SENTINEL_MASK).exists());
        assert!(!anat.join(SENTINEL_ANNOTATED_MASK).exists());

        let temp = root.join("derivatives/lst-ai-v1.1.0/sub-001/ses-20200101/temp");
        assert!(temp.join("sub-001_ses-20200101_space-flair_T1w.nii.gz").exists());
        assert!(temp.join("sub-001_ses-20200101_brainmask.nii.gz").exists());

        let calls = tool.calls.lock().expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].flair, raw_anat_path(&root, "001", "20200101", FLAIR_SUFFIX));
        assert_eq!(calls[0].temp_dir.as_deref(), Some(temp.as_path()));
        drop(calls);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn second_run_on_complete_session_changes_nothing() {
        let root = temp_root("idempotent");
        let t1 = raw_session(&root, "001", "20200101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::Success);
        let driver = RunDriver::new(&config, &tool);

        assert_eq!(driver.process_session(&t1).outcome, SessionOutcome::Segmented);
        let before = snapshot(&root);
        let report = driver.process_session(&t1);
        assert_eq!(report.outcome, SessionOutcome::SkippedExisting);
        assert_eq!(snapshot(&root), before);
        assert_eq!(tool.call_count(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn partial_output_tears_down_the_derivative_tree() {
        let root = temp_root("partial");
        let t1 = raw_session(&root, "001", "20200101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::OnlyMask);
        let driver = RunDriver::new(&config, &tool);

        let report = driver.process_session(&t1);
        match &report.outcome {
            SessionOutcome::Recoverable(reason) => {
                assert!(reason.contains(SENTINEL_ANNOTATED_MASK), "{}", reason)
            }
            other => panic!("expected recoverable failure, got {:?}", other),
        }
        let layout = driver.layout();
        assert!(!layout.session_dir("001", "20200101").exists());
        assert!(!layout.subject_dir("001").exists());

        let availability = check_availability(
            &[root.join("sub-001")],
            layout.root(),
            LESION_MASK_SUFFIX,
        );
        assert_eq!(availability.missing, vec![root.join("sub-001")]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_zero_exit_fails_even_with_sentinels_present() {
        let root = temp_root("exitcode");
        let t1 = raw_session(&root, "001", "20200101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::NonZeroExit);
        let driver = RunDriver::new(&config, &tool);

        let report = driver.process_session(&t1);
        assert!(matches!(report.outcome, SessionOutcome::Recoverable(_)));
        assert!(!driver.layout().session_dir("001", "20200101").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn teardown_keeps_sibling_sessions() {
        let root = temp_root("siblings");
        let config = config(&root);
        let layout = config.layout();
        let done = layout.output_file("001", "20190101", LESION_MASK_SUFFIX);
        fs::create_dir_all(done.parent().expect("anat")).expect("anat");
        fs::write(&done, b"mask").expect("mask");
        let t1 = raw_session(&root, "001", "20200101", true);
        let tool = FakeTool::new(Behavior::OnlyMask);
        let driver = RunDriver::new(&config, &tool);

        let report = driver.process_session(&t1);
        assert!(matches!(report.outcome, SessionOutcome::Recoverable(_)));
        assert!(done.exists());
        assert!(!layout.session_dir("001", "20200101").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_flair_is_recoverable_and_creates_nothing() {
        let root = temp_root("noflair");
        let t1 = raw_session(&root, "001", "20200101", false);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::Success);
        let driver = RunDriver::new(&config, &tool);

        let report = driver.process_session(&t1);
        match report.outcome {
            SessionOutcome::Recoverable(reason) => assert!(reason.contains("FLAIR")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(tool.call_count(), 0);
        assert!(!root.join("derivatives").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn subject_sessions_continue_after_a_failure() {
        let root = temp_root("subject");
        raw_session(&root, "002", "20200101", false);
        raw_session(&root, "002", "20210101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::Success);
        let driver = RunDriver::new(&config, &tool);

        let reports = driver.process_subject(&root.join("sub-002"));
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].outcome, SessionOutcome::Recoverable(_)));
        assert_eq!(reports[1].outcome, SessionOutcome::Segmented);
        assert_eq!(reports[1].session, "20210101");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remove_temp_drops_auxiliary_directory() {
        let root = temp_root("removetemp");
        let t1 = raw_session(&root, "001", "20200101", true);
        let mut config = config(&root);
        config.remove_temp = true;
        let tool = FakeTool::new(Behavior::Success);
        let driver = RunDriver::new(&config, &tool);

        assert_eq!(driver.process_session(&t1).outcome, SessionOutcome::Segmented);
        assert!(tool.calls.lock().expect("calls")[0].temp_dir.is_none());
        assert!(!driver.layout().temp_dir("001", "20200101").exists());
        assert!(driver
            .layout()
            .output_file("001", "20200101", LESION_MASK_SUFFIX)
            .exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn spawn_failure_is_recoverable_and_tears_down() {
        let root = temp_root("spawn");
        let t1 = raw_session(&root, "001", "20200101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::SpawnError);
        let driver = RunDriver::new(&config, &tool);

        let report = driver.process_session(&t1);
        match &report.outcome {
            SessionOutcome::Recoverable(reason) => {
                assert!(reason.contains("could not be run"), "{}", reason)
            }
            other => panic!("expected recoverable failure, got {:?}", other),
        }
        assert_eq!(tool.call_count(), 1);
        assert!(!driver.layout().session_dir("001", "20200101").exists());
        assert!(!driver.layout().subject_dir("001").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn panicking_session_is_recoverable_and_siblings_run() {
        let root = temp_root("panic");
        raw_session(&root, "001", "20200101", true);
        raw_session(&root, "001", "20210101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::Panic);
        let driver = RunDriver::new(&config, &tool);

        let reports = driver.process_subject(&root.join("sub-001"));
        assert_eq!(reports.len(), 2);
        for report in &reports {
            match &report.outcome {
                SessionOutcome::Recoverable(reason) => {
                    assert!(reason.starts_with("panicked: model weights"), "{}", reason)
                }
                other => panic!("expected recoverable failure, got {:?}", other),
            }
        }
        assert_eq!(tool.call_count(), 2);
        assert!(!driver.layout().subject_dir("001").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn incomplete_teardown_is_fatal_and_next_session_runs() {
        let root = temp_root("fatal");
        raw_session(&root, "001", "20200101", true);
        raw_session(&root, "001", "20210101", true);
        let config = config(&root);
        let tool = FakeTool::new(Behavior::OnlyMask);
        let mut driver = RunDriver::new(&config, &tool);
        driver.remove_tree = |_| Ok(());

        let reports = driver.process_subject(&root.join("sub-001"));
        assert_eq!(reports.len(), 2);
        for report in &reports {
            match &report.outcome {
                SessionOutcome::Fatal(reason) => {
                    assert!(reason.contains("still present"), "{}", reason)
                }
                other => panic!("expected fatal outcome, got {:?}", other),
            }
        }
        assert_eq!(reports[1].session, "20210101");
        assert_eq!(tool.call_count(), 2);
        assert!(driver.layout().anat_dir("001", "20200101").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn verify_removed_reports_leftovers_as_fatal() {
        let root = temp_root("verify");
        let anat = root.join("ses-20200101/anat");
        fs::create_dir_all(&anat).expect("anat");
        let err = verify_removed(&root.join("ses-20200101"), &[anat.clone(), root.join("gone")])
            .expect_err("leftover must fail");
        assert!(err.is_fatal());
        match err {
            SessionError::Reconciliation { remaining, .. } => assert_eq!(remaining, vec![anat]),
            other => panic!("unexpected error {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn auxiliary_names_follow_bids_prefix() {
        let prefix = bids_prefix("001", "20200101");
        assert_eq!(
            auxiliary_file_name("sub-X_ses-Y_space-flair_FLAIR.nii.gz", &prefix).as_deref(),
            Some("sub-001_ses-20200101_space-flair_FLAIR.nii.gz")
        );
        assert_eq!(
            auxiliary_file_name("mask.nii.gz", &prefix).as_deref(),
            Some("sub-001_ses-20200101_mask.nii.gz")
        );
        assert_eq!(
            auxiliary_file_name("sub-001_ses-20200101_mask.nii.gz", &prefix),
            None
        );
    }
}
