//! Run configuration for the vistrain engine
//!
//! Configuration is a typed, hierarchically-keyed structure loaded from YAML.
//! It is immutable after construction and passed by reference into every
//! component; facts resolved at setup time (world size, effective seed) live
//! in [`crate::engine::ResolvedRunState`] instead of being written back here.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Run mode, fixed at engine construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Training with optional in-loop evaluation
    Train,
    /// Standalone evaluation
    Eval,
    /// Batch inference
    Infer,
    /// Export to an inference artifact
    Export,
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "eval" => Ok(Self::Eval),
            "infer" => Ok(Self::Infer),
            "export" => Ok(Self::Export),
            other => Err(Error::config(format!(
                "invalid run mode '{other}', expected one of train/eval/infer/export"
            ))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Train => "train",
            Self::Eval => "eval",
            Self::Infer => "infer",
            Self::Export => "export",
        };
        f.write_str(s)
    }
}

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Global run options
    #[serde(rename = "Global")]
    pub global: GlobalSection,

    /// Architecture selection and export shaping options
    #[serde(rename = "Arch")]
    pub arch: ArchSection,

    /// Declarative dataloader options, interpreted by the component factory
    #[serde(rename = "DataLoader", default)]
    pub dataloader: SectionOptions,

    /// Loss declarations per split
    #[serde(rename = "Loss", default)]
    pub loss: SplitSection,

    /// Metric declarations per split
    #[serde(rename = "Metric", default)]
    pub metric: Option<SplitSection>,

    /// Optimizer and learning-rate schedule declaration
    #[serde(rename = "Optimizer", default)]
    pub optimizer: OptimizerSection,

    /// Mixed-precision options; absent means full precision
    #[serde(rename = "AMP", default)]
    pub amp: Option<AmpSection>,

    /// EMA shadow-model options; absent disables EMA
    #[serde(rename = "EMA", default)]
    pub ema: Option<EmaSection>,

    /// Inference-mode options
    #[serde(rename = "Infer", default)]
    pub infer: Option<SectionOptions>,
}

/// Opaque declarative options handed through to the component factory
pub type SectionOptions = HashMap<String, serde_yaml::Value>;

/// Global run options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSection {
    /// Root directory for logs and checkpoints
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Device target: one of cpu/gpu/cuda/metal
    #[serde(default = "default_device")]
    pub device: String,

    /// Request distributed training
    #[serde(default)]
    pub distributed: bool,

    /// Total epoch count; terminal state of the epoch loop
    #[serde(default = "default_one")]
    pub epochs: usize,

    /// Evaluate on a cadence while training
    #[serde(default)]
    pub eval_during_train: bool,

    /// Evaluate every `eval_interval` epochs
    #[serde(default = "default_one")]
    pub eval_interval: usize,

    /// Epochs after which evaluation may start
    #[serde(default)]
    pub start_eval_epoch: usize,

    /// Persist an `epoch_{n}` checkpoint every `save_interval` epochs; 0 disables
    #[serde(default = "default_one")]
    pub save_interval: usize,

    /// Intra-epoch logging cadence, in batches
    #[serde(default = "default_print_batch_step")]
    pub print_batch_step: usize,

    /// Gradient-accumulation grouping: optimizer steps once per `update_freq` batches
    #[serde(default = "default_one")]
    pub update_freq: usize,

    /// Manual iterations-per-epoch override for iteration-driven training
    #[serde(default)]
    pub iter_per_epoch: Option<usize>,

    /// Pretrained weights, either a URL or a local safetensors path
    #[serde(default)]
    pub pretrained_model: Option<String>,

    /// Checkpoint directory to resume from
    #[serde(default)]
    pub checkpoints: Option<PathBuf>,

    /// Base random seed; required for reproducible multi-rank training
    #[serde(default)]
    pub seed: Option<u64>,

    /// Input shape (channels, height, width) for the export artifact
    #[serde(default = "default_image_shape")]
    pub image_shape: Vec<usize>,

    /// Emit scalar time-series records for external visualization.
    ///
    /// `use_visualdl` is accepted as an alias for configurations written
    /// against the established key name.
    #[serde(default, alias = "use_visualdl")]
    pub use_scalar_log: bool,

    /// Directory for the exported inference artifact
    #[serde(default = "default_inference_dir")]
    pub save_inference_dir: PathBuf,

    /// Multi-label task: export applies sigmoid instead of softmax
    #[serde(default)]
    pub use_multilabel: bool,
}

/// Architecture selection and export shaping options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchSection {
    /// Architecture name, resolved by the component factory
    pub name: String,

    /// Sub-model to export when the base model is a multi-branch distillation model
    #[serde(default)]
    pub infer_model_name: Option<String>,

    /// Output key to export; `"features"` replaces the task head with identity
    #[serde(default)]
    pub infer_output_key: Option<String>,

    /// Apply softmax on export (ignored for multi-label tasks)
    #[serde(default = "default_true")]
    pub infer_add_softmax: bool,

    /// Remaining architecture options, interpreted by the factory
    #[serde(flatten, default)]
    pub options: SectionOptions,
}

/// Per-split declarations (loss and metric sections)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitSection {
    /// Train-split declaration
    #[serde(rename = "Train", default)]
    pub train: Option<serde_yaml::Value>,

    /// Eval-split declaration
    #[serde(rename = "Eval", default)]
    pub eval: Option<serde_yaml::Value>,
}

impl SplitSection {
    /// Whether any split is declared
    pub fn is_declared(&self) -> bool {
        self.train.is_some() || self.eval.is_some()
    }
}

/// Optimizer declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSection {
    /// Optimizer name; also selects the reference GPU topology for the warning check
    #[serde(default = "default_optimizer_name")]
    pub name: String,

    /// Base learning rate
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// Remaining optimizer/schedule options, interpreted by the factory
    #[serde(flatten, default)]
    pub options: SectionOptions,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            name: default_optimizer_name(),
            lr: default_lr(),
            options: SectionOptions::default(),
        }
    }
}

/// Mixed-precision options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmpSection {
    /// Requested optimization level; invalid values degrade to O1 with a warning
    #[serde(default = "default_amp_level")]
    pub level: String,

    /// Initial loss scale
    #[serde(default = "default_scale_loss")]
    pub scale_loss: f64,

    /// Adjust the loss scale dynamically on overflow
    #[serde(default)]
    pub use_dynamic_loss_scaling: bool,

    /// Run evaluation in low precision
    #[serde(default)]
    pub use_fp16_test: bool,
}

/// EMA shadow-model options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaSection {
    /// Decay applied to the shadow parameters after each optimizer step
    #[serde(default = "default_ema_decay")]
    pub decay: f64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_one() -> usize {
    1
}

fn default_print_batch_step() -> usize {
    10
}

fn default_image_shape() -> Vec<usize> {
    vec![3, 224, 224]
}

fn default_inference_dir() -> PathBuf {
    PathBuf::from("./inference")
}

fn default_true() -> bool {
    true
}

fn default_optimizer_name() -> String {
    "Momentum".to_string()
}

fn default_lr() -> f64 {
    0.1
}

fn default_amp_level() -> String {
    "O1".to_string()
}

fn default_scale_loss() -> f64 {
    1.0
}

fn default_ema_decay() -> f64 {
    0.9999
}

impl RunConfig {
    /// Load a configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse a configuration from a YAML string
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.global.device.as_str(), "cpu" | "gpu" | "cuda" | "metal") {
            return Err(Error::config(format!(
                "invalid device '{}', expected one of cpu/gpu/cuda/metal",
                self.global.device
            )));
        }
        if self.global.epochs == 0 {
            return Err(Error::config("Global.epochs must be at least 1"));
        }
        if self.global.eval_interval == 0 {
            return Err(Error::config("Global.eval_interval must be at least 1"));
        }
        if self.global.update_freq == 0 {
            return Err(Error::config("Global.update_freq must be at least 1"));
        }
        if let Some(ema) = &self.ema {
            if !(ema.decay > 0.0 && ema.decay <= 1.0) {
                return Err(Error::config(format!(
                    "EMA.decay must be in (0, 1], got {}",
                    ema.decay
                )));
            }
        }
        Ok(())
    }

    /// Resolve the configured device target.
    ///
    /// An unknown device string is a fatal configuration error; an unavailable
    /// backend surfaces as the runtime's own error.
    pub fn resolve_device(&self) -> Result<Device> {
        match self.global.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::new_cuda(0)?),
            "metal" => Ok(Device::new_metal(0)?),
            other => Err(Error::config(format!("invalid device '{other}'"))),
        }
    }

    /// Directory holding logs and checkpoints for this run
    pub fn run_dir(&self) -> PathBuf {
        self.global.output_dir.join(&self.arch.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
Global:
  epochs: 4
Arch:
  name: toy_linear
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = RunConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.global.epochs, 4);
        assert_eq!(config.global.device, "cpu");
        assert_eq!(config.global.update_freq, 1);
        assert!(config.amp.is_none());
        assert!(config.ema.is_none());
        assert!(config.arch.infer_add_softmax);
    }

    #[test]
    fn rejects_invalid_device() {
        let raw = r#"
Global:
  device: tpu
Arch:
  name: toy_linear
"#;
        let err = RunConfig::from_yaml(raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_invalid_mode_string() {
        assert!("predict".parse::<RunMode>().is_err());
        assert_eq!("Train".parse::<RunMode>().unwrap(), RunMode::Train);
    }

    #[test]
    fn rejects_non_integer_seed() {
        let raw = r#"
Global:
  seed: "not-a-number"
Arch:
  name: toy_linear
"#;
        assert!(RunConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn parses_optional_sections() {
        let raw = r#"
Global:
  epochs: 2
  eval_during_train: true
Arch:
  name: toy_linear
AMP:
  level: O2
  use_dynamic_loss_scaling: true
EMA:
  decay: 0.999
Loss:
  Train:
    name: CrossEntropy
Metric:
  Train:
    name: TopkAcc
  Eval:
    name: TopkAcc
"#;
        let config = RunConfig::from_yaml(raw).unwrap();
        assert_eq!(config.amp.as_ref().unwrap().level, "O2");
        assert!(config.amp.as_ref().unwrap().use_dynamic_loss_scaling);
        assert_eq!(config.ema.as_ref().unwrap().decay, 0.999);
        assert!(config.loss.train.is_some());
        assert!(config.metric.as_ref().unwrap().eval.is_some());
    }

    #[test]
    fn scalar_log_accepts_the_visualdl_alias() {
        let raw = r#"
Global:
  use_visualdl: true
Arch:
  name: toy_linear
"#;
        let config = RunConfig::from_yaml(raw).unwrap();
        assert!(config.global.use_scalar_log);

        let raw = r#"
Global:
  use_scalar_log: true
Arch:
  name: toy_linear
"#;
        let config = RunConfig::from_yaml(raw).unwrap();
        assert!(config.global.use_scalar_log);
    }

    #[test]
    fn run_dir_joins_arch_name() {
        let config = RunConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.run_dir(), PathBuf::from("./output/toy_linear"));
    }
}
