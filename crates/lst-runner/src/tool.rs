//! Invocation contract of the external segmentation tool.

use crate::config::{Clipping, Device, PipelineConfig};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// Sentinel outputs whose presence marks a finished segmentation.
pub const SENTINEL_MASK: &str = "space-flair_seg-lst.nii.gz";
pub const SENTINEL_ANNOTATED_MASK: &str = "space-flair_desc-annotated_seg-lst.nii.gz";
pub const RAW_LESION_STATS: &str = "lesion_stats.csv";
pub const RAW_ANNOTATED_LESION_STATS: &str = "annotated_lesion_stats.csv";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub t1: PathBuf,
    pub flair: PathBuf,
    pub output_dir: PathBuf,
    /// Only set when auxiliary files are retained.
    pub temp_dir: Option<PathBuf>,
    pub device: Device,
    pub clipping: Clipping,
}

impl ToolInvocation {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--t1".to_string(),
            self.t1.to_string_lossy().to_string(),
            "--flair".to_string(),
            self.flair.to_string_lossy().to_string(),
            "--output".to_string(),
            self.output_dir.to_string_lossy().to_string(),
        ];
        if let Some(temp) = &self.temp_dir {
            args.push("--temp".to_string());
            args.push(temp.to_string_lossy().to_string());
        }
        args.push("--device".to_string());
        args.push(self.device.as_arg().to_string());
        args.push("--clipping".to_string());
        args.push(self.clipping.low.to_string());
        args.push(self.clipping.high.to_string());
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ToolExit {
    pub fn success() -> Self {
        Self { code: Some(0) }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        self.code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

/// Runs one segmentation to completion. Implementations block until the
/// tool exits; an `Err` means the tool could not be run at all.
pub trait SegmentationTool: Sync {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolExit>;
}

/// The LST-AI command line, spawned without a shell.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    program: String,
    leading_args: Vec<String>,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.tool.clone()).with_leading_args(config.tool_args.clone())
    }

    pub fn command_line(&self, invocation: &ToolInvocation) -> Vec<String> {
        let mut parts = Vec::with_capacity(1 + self.leading_args.len() + 14);
        parts.push(self.program.clone());
        parts.extend(self.leading_args.iter().cloned());
        parts.extend(invocation.args());
        parts
    }
}

impl SegmentationTool for ExternalTool {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolExit> {
        if self.program.trim().is_empty() {
            return Err(anyhow!("segmentation tool program is empty"));
        }
        debug!(command = ?self.command_line(invocation), "spawning segmentation tool");
        let status = Command::new(&self.program)
            .args(&self.leading_args)
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        Ok(ToolExit {
            code: status.code(),
        })
    }
}
