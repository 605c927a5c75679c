use crate::availability::{check_availability, Availability, LESION_MASK_SUFFIX};
use crate::config::PipelineConfig;
use crate::driver::{RunDriver, SessionOutcome, SessionReport};
use crate::tool::SegmentationTool;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use lst_core::{ensure_dir, list_subject_dirs, partition};
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use tracing::{error, info, info_span};

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub derivatives_dir: PathBuf,
    pub availability: Availability,
    pub shards: Vec<Vec<PathBuf>>,
}

impl BatchPlan {
    pub fn shard_sizes(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.len()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub index: usize,
    pub subjects: Vec<PathBuf>,
    pub sessions: Vec<SessionReport>,
    /// The worker thread panicked; `sessions` is empty in that case.
    pub panicked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub segmented: usize,
    pub skipped_existing: usize,
    pub recoverable: usize,
    pub fatal: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub derivatives_dir: PathBuf,
    pub workers: usize,
    pub missing_subjects: usize,
    pub complete_subjects: usize,
    pub shards: Vec<ShardReport>,
}

impl BatchReport {
    pub fn sessions(&self) -> impl Iterator<Item = &SessionReport> {
        self.shards.iter().flat_map(|s| s.sessions.iter())
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for report in self.sessions() {
            match report.outcome {
                SessionOutcome::Segmented => counts.segmented += 1,
                SessionOutcome::SkippedExisting => counts.skipped_existing += 1,
                SessionOutcome::Recoverable(_) => counts.recoverable += 1,
                SessionOutcome::Fatal(_) => counts.fatal += 1,
            }
        }
        counts
    }

    pub fn panicked_shards(&self) -> usize {
        self.shards.iter().filter(|s| s.panicked).count()
    }

    /// No fatal session and no lost worker.
    pub fn is_clean(&self) -> bool {
        self.counts().fatal == 0 && self.panicked_shards() == 0
    }
}

/// Classifies subjects and shards the incomplete ones. Nothing is written.
pub fn plan_batch(config: &PipelineConfig) -> Result<BatchPlan> {
    config.validate()?;
    if !config.dataset_root.is_dir() {
        return Err(anyhow!(
            "dataset root {} is not a directory",
            config.dataset_root.display()
        ));
    }
    let layout = config.layout();
    let subjects = list_subject_dirs(&config.dataset_root);
    let availability = check_availability(&subjects, layout.root(), LESION_MASK_SUFFIX);
    let shards = partition(&availability.missing, config.workers)?;
    Ok(BatchPlan {
        derivatives_dir: layout.root().to_path_buf(),
        availability,
        shards,
    })
}

/// Runs the segmentation over every incomplete subject with one worker per
/// shard and waits for all of them.
pub fn run_batch(config: &PipelineConfig, tool: &dyn SegmentationTool) -> Result<BatchReport> {
    let started_at = Utc::now();
    let plan = plan_batch(config)?;
    ensure_dir(&plan.derivatives_dir).with_context(|| {
        format!(
            "failed to create derivatives directory {}",
            plan.derivatives_dir.display()
        )
    })?;
    info!(
        incomplete = plan.availability.missing.len(),
        complete = plan.availability.complete.len(),
        workers = config.workers,
        "subjects classified"
    );

    let shards = thread::scope(|scope| {
        let handles: Vec<_> = plan
            .shards
            .iter()
            .enumerate()
            .map(|(index, subjects)| {
                let handle = if subjects.is_empty() {
                    None
                } else {
                    Some(scope.spawn(move || run_shard(config, tool, index, subjects)))
                };
                (index, subjects, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(index, subjects, handle)| match handle.map(|h| h.join()) {
                None => ShardReport {
                    index,
                    subjects: Vec::new(),
                    sessions: Vec::new(),
                    panicked: false,
                },
                Some(Ok(sessions)) => ShardReport {
                    index,
                    subjects: subjects.clone(),
                    sessions,
                    panicked: false,
                },
                Some(Err(_)) => {
                    error!(shard = index, "worker panicked");
                    ShardReport {
                        index,
                        subjects: subjects.clone(),
                        sessions: Vec::new(),
                        panicked: true,
                    }
                }
            })
            .collect::<Vec<_>>()
    });

    let report = BatchReport {
        started_at,
        finished_at: Utc::now(),
        derivatives_dir: plan.derivatives_dir,
        workers: config.workers,
        missing_subjects: plan.availability.missing.len(),
        complete_subjects: plan.availability.complete.len(),
        shards,
    };
    let counts = report.counts();
    info!(
        segmented = counts.segmented,
        skipped = counts.skipped_existing,
        recoverable = counts.recoverable,
        fatal = counts.fatal,
        "batch finished"
    );
    Ok(report)
}

fn run_shard(
    config: &PipelineConfig,
    tool: &dyn SegmentationTool,
    index: usize,
    subjects: &[PathBuf],
) -> Vec<SessionReport> {
    let span = info_span!("shard", index);
    let _enter = span.enter();
    info!(subjects = subjects.len(), "worker started");
    let driver = RunDriver::new(config, tool);
    subjects
        .iter()
        .flat_map(|subject| driver.process_subject(subject))
        .collect()
}
