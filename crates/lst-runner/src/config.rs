use anyhow::{Context, Result};
use lst_core::{DerivativeLayout, DEFAULT_PIPELINE_TAG};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("invalid clipping bounds {low}/{high}: expected 0 <= low < high <= 100")]
    InvalidClipping { low: f64, high: f64 },
    #[error("tool program must not be empty")]
    EmptyTool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    #[default]
    Gpu,
}

impl Device {
    /// Value passed to `--device`.
    pub fn as_arg(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "0",
        }
    }
}

/// Percentile bounds for intensity clipping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Clipping {
    pub low: f64,
    pub high: f64,
}

impl Default for Clipping {
    fn default() -> Self {
        Self {
            low: 0.5,
            high: 99.5,
        }
    }
}

impl Clipping {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.low) || !in_range(self.high) || self.low >= self.high {
            return Err(ConfigError::InvalidClipping {
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }
}

fn default_pipeline_tag() -> String {
    DEFAULT_PIPELINE_TAG.to_string()
}

fn default_tool() -> String {
    "lst".to_string()
}

pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub dataset_root: PathBuf,
    #[serde(default = "default_pipeline_tag")]
    pub pipeline_tag: String,
    #[serde(default = "default_tool")]
    pub tool: String,
    #[serde(default)]
    pub tool_args: Vec<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub remove_temp: bool,
    #[serde(default)]
    pub clipping: Clipping,
}

impl PipelineConfig {
    pub fn new(dataset_root: &Path) -> Self {
        Self {
            dataset_root: dataset_root.to_path_buf(),
            pipeline_tag: default_pipeline_tag(),
            tool: default_tool(),
            tool_args: Vec::new(),
            workers: default_workers(),
            device: Device::default(),
            remove_temp: false,
            clipping: Clipping::default(),
        }
    }

    /// Reads a YAML (or JSON) configuration file. A relative `dataset_root`
    /// is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        if config.dataset_root.is_relative() {
            if let Some(parent) = path.parent() {
                config.dataset_root = parent.join(&config.dataset_root);
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.tool.trim().is_empty() {
            return Err(ConfigError::EmptyTool);
        }
        self.clipping.validate()
    }

    pub fn layout(&self) -> DerivativeLayout {
        DerivativeLayout::new(&self.dataset_root, &self.pipeline_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn defaults_match_pipeline_conventions() {
        let config = PipelineConfig::new(Path::new("/data/bids"));
        assert_eq!(config.pipeline_tag, "lst-ai-v1.1.0");
        assert_eq!(config.tool, "lst");
        assert_eq!(config.clipping, Clipping { low: 0.5, high: 99.5 });
        assert_eq!(config.device.as_arg(), "0");
        assert!(config.workers >= 1);
        config.validate().expect("defaults are valid");
        assert_eq!(
            config.layout().root(),
            Path::new("/data/bids/derivatives/lst-ai-v1.1.0")
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = PipelineConfig::new(Path::new("/d"));
        config.workers = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkers));
        config.workers = 2;
        config.clipping = Clipping { low: 99.5, high: 0.5 };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidClipping { .. })
        ));
        config.clipping = Clipping { low: 1.0, high: 101.0 };
        assert!(config.validate().is_err());
        config.clipping = Clipping::default();
        config.tool = " ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyTool));
    }

    #[test]
    fn load_yaml_applies_defaults_and_resolves_root() {
        let dir = std::env::temp_dir().join(format!(
            "lst_config_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("pipeline.yaml");
        fs::write(
            &path,
            "dataset_root: bids\nworkers: 3\ndevice: cpu\nclipping:\n  low: 1.0\n  high: 99.0\n",
        )
        .expect("write config");

        let config = PipelineConfig::load(&path).expect("load");
        assert_eq!(config.dataset_root, dir.join("bids"));
        assert_eq!(config.workers, 3);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.clipping, Clipping { low: 1.0, high: 99.0 });
        assert_eq!(config.pipeline_tag, "lst-ai-v1.1.0");
        assert!(!config.remove_temp);
        let _ = fs::remove_dir_all(dir);
    }
}
