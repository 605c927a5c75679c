//! Batch LST-AI segmentation over a BIDS dataset.
//!
//! [`plan_batch`] classifies subjects by whether any processable session
//! still lacks a lesion mask and shards the incomplete ones; [`run_batch`]
//! hands each shard to its own worker thread, which drives the external tool
//! session by session and returns a structured report.

pub mod availability;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod tool;

pub use availability::{check_availability, session_status, Availability, SessionStatus};
pub use config::{Clipping, ConfigError, Device, PipelineConfig};
pub use dispatch::{plan_batch, run_batch, BatchPlan, BatchReport, OutcomeCounts, ShardReport};
pub use driver::{RunDriver, SessionError, SessionOutcome, SessionReport};
pub use tool::{ExternalTool, SegmentationTool, ToolExit, ToolInvocation};
