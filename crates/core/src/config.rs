use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::components::Connectivity;
use crate::planner::validate_window;
use crate::volume::Shape3;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VOXEVAL_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EvalConfig {
    pub window: WindowConfig,
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub postprocess: PostprocessConfig,
    pub output: OutputConfig,
    pub metrics: MetricsConfig,
}

/// Patch size and nominal strides of the sliding window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowConfig {
    pub patch_size: Shape3,
    pub stride_xy: usize,
    pub stride_z: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub num_classes: usize,
    pub auxiliary_head_present: bool,
    pub backend: InferenceBackend,
    pub activation: OutputActivation,
    pub trt_cache_dir: PathBuf,
}

/// Normalization the ONNX adapter applies to raw class outputs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    #[default]
    Softmax,
    /// The model already emits probabilities.
    None,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntensityPreprocess {
    #[default]
    None,
    Zscore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PreprocessConfig {
    pub intensity: IntensityPreprocess,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PostprocessConfig {
    pub apply_largest_component_filter: bool,
    pub connectivity: Connectivity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub persist_outputs: bool,
    pub output_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub voxel_spacing: [f64; 3],
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            patch_size: [112, 112, 80],
            stride_xy: 18,
            stride_z: 4,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/segmentation.onnx"),
            num_classes: 2,
            auxiliary_head_present: false,
            backend: InferenceBackend::default(),
            activation: OutputActivation::default(),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            persist_outputs: false,
            output_directory: PathBuf::from("predictions"),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            voxel_spacing: [1.0, 1.0, 1.0],
        }
    }
}

impl EvalConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Check the settings the pipeline relies on before any volume is touched.
    pub fn validate(&self) -> Result<()> {
        validate_window(
            self.window.patch_size,
            self.window.stride_xy,
            self.window.stride_z,
        )?;
        if self.model.num_classes == 0 {
            bail!("model.num_classes must be at least 1");
        }
        if self.model.num_classes > usize::from(u16::MAX) + 1 {
            bail!(
                "model.num_classes {} exceeds the label range",
                self.model.num_classes
            );
        }
        if self
            .metrics
            .voxel_spacing
            .iter()
            .any(|&spacing| !(spacing.is_finite() && spacing > 0.0))
        {
            bail!(
                "metrics.voxel_spacing must be positive, got {:?}",
                self.metrics.voxel_spacing
            );
        }
        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VOXEVAL_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
/// Returns whether a new config file was written.
pub fn initialize_data_dir(data_dir: &Path) -> Result<bool> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if cfg_path.exists() {
        return Ok(false);
    }
    EvalConfig::default().save_to_path(&cfg_path)?;
    Ok(true)
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
