//! Collaborator interfaces
//!
//! The engine sequences calls into these interfaces and makes decisions based
//! on their scalar outputs; it never implements the numeric algorithms
//! behind them. Concrete collaborators are supplied by a
//! [`ComponentFactory`], keyed by the declarative configuration.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};

use crate::config::RunConfig;
use crate::error::{Error, Result};

pub mod baseline;

/// One batch of inputs and targets
#[derive(Debug, Clone)]
pub struct Batch {
    /// Model inputs, batch-major
    pub inputs: Tensor,
    /// Supervision targets
    pub targets: Tensor,
}

/// Structured model output.
///
/// Multi-branch models (e.g. distillation) return a named tree; the export
/// pipeline navigates it by branch name and output key.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// A plain tensor output
    Tensor(Tensor),
    /// Named sub-outputs, possibly nested
    Named(HashMap<String, ModelOutput>),
}

impl ModelOutput {
    /// The output as a plain tensor, if it is one
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Named(_) => None,
        }
    }

    /// Look up a named sub-output
    pub fn get(&self, key: &str) -> Option<&ModelOutput> {
        match self {
            Self::Tensor(_) => None,
            Self::Named(map) => map.get(key),
        }
    }

    /// The primary logits tensor: the tensor itself, or the `logits` sub-key
    /// of a structured output.
    pub fn logits(&self) -> Result<&Tensor> {
        match self {
            Self::Tensor(t) => Ok(t),
            Self::Named(map) => map
                .get("logits")
                .and_then(ModelOutput::as_tensor)
                .ok_or_else(|| Error::build("structured output has no 'logits' tensor")),
        }
    }
}

/// Which dataloader split to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSplit {
    /// Training split
    Train,
    /// Evaluation split
    Eval,
}

/// A finite, restartable, batch-indexable input sequence
pub trait DataLoader {
    /// Number of batches in one full pass
    fn num_batches(&self) -> usize;

    /// Whether the reported length counts the tail batch exactly.
    ///
    /// A reader without a reliable tail-batch signal returns `false`; the
    /// builder then treats the last reported batch as unusable.
    fn tail_batch_exact(&self) -> bool {
        true
    }

    /// Restart the sequence from the beginning
    fn reset(&mut self);

    /// Fetch the next batch; `None` ends the pass
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// A sublayer supporting one-time structural re-parameterization
pub trait RepLayer {
    /// Whether the transform has already been applied
    fn is_repped(&self) -> bool;

    /// Apply the transform; callers must skip already-repped layers
    fn rep(&mut self) -> Result<()>;
}

/// A trainable parametric function
pub trait Model {
    /// Run the model on one batch of inputs
    fn forward(&self, input: &Tensor) -> Result<ModelOutput>;

    /// Snapshot of all named parameters
    fn state(&self) -> Result<HashMap<String, Tensor>>;

    /// Load a parameter snapshot produced by [`Model::state`]
    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()>;

    /// Switch between training and inference behavior
    fn set_training(&mut self, training: bool);

    /// Current training/inference mode
    fn is_training(&self) -> bool;

    /// Sublayers exposing re-parameterization hooks
    fn rep_sublayers(&mut self) -> Vec<&mut dyn RepLayer> {
        Vec::new()
    }

    /// Replace the task head with an identity pass-through, returning whether
    /// the model supports that substitution.
    fn replace_head_with_identity(&mut self) -> bool {
        false
    }

    /// Whether a quantization context is attached (selects the int8 export path)
    fn is_quantized(&self) -> bool {
        false
    }
}

/// A loss function of predictions and targets.
///
/// Returns the total loss tensor plus named scalar components for the
/// per-epoch statistics. May own trainable parameters, in which case they are
/// checkpointed and distributed-wrapped alongside the model.
pub trait Loss {
    /// Compute the loss for one batch
    fn compute(&self, output: &ModelOutput, targets: &Tensor)
        -> Result<(Tensor, HashMap<String, f64>)>;

    /// Trainable parameters owned by the loss, empty for pure losses
    fn trainable_parameters(&self) -> HashMap<String, Tensor> {
        HashMap::new()
    }

    /// Load parameters saved from [`Loss::trainable_parameters`]
    fn load_state(&mut self, _state: &HashMap<String, Tensor>) -> Result<()> {
        Ok(())
    }
}

/// A metric function of predictions and targets
pub trait Metric {
    /// Compute named scalar metrics for one batch
    fn compute(&self, output: &ModelOutput, targets: &Tensor) -> Result<HashMap<String, f64>>;

    /// Name of the scalar used for best-model selection (higher is better)
    fn primary_key(&self) -> &str;
}

/// An optimizer consuming gradients from the autodiff runtime.
///
/// `grad_scale` multiplies gradients before the update; it folds in both the
/// inverse loss scale under mixed precision and the gradient-accumulation
/// divisor, and is `1.0` otherwise.
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from a gradient store
    fn step(&mut self, grads: &GradStore, grad_scale: f64) -> Result<()>;

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Override the learning rate (driven by schedules)
    fn set_learning_rate(&mut self, lr: f64);

    /// Updates applied so far
    fn step_count(&self) -> usize;

    /// Serializable optimizer state for checkpointing
    fn state_dict(&self) -> Result<serde_json::Value>;

    /// Restore state saved by [`Optimizer::state_dict`]
    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<()>;
}

/// A learning-rate schedule
pub trait LrScheduler {
    /// Schedule name
    fn name(&self) -> &str;

    /// Advance the schedule; plateau-style schedules consume the metric
    fn step(&mut self, metric: Option<f64>);

    /// Learning rate for the next update
    fn get_lr(&self) -> f64;

    /// Whether the schedule advances per epoch rather than per step
    fn by_epoch(&self) -> bool {
        false
    }

    /// Whether the schedule is metric-driven (plateau-style)
    fn metric_driven(&self) -> bool {
        false
    }
}

/// Factory for concrete collaborators, keyed by the declarative configuration
pub trait ComponentFactory {
    /// Build a dataloader for one split
    fn build_dataloader(
        &self,
        config: &RunConfig,
        split: DataSplit,
        device: &Device,
    ) -> Result<Box<dyn DataLoader>>;

    /// Build a loss function for one split
    fn build_loss(
        &self,
        config: &RunConfig,
        split: DataSplit,
        device: &Device,
    ) -> Result<Box<dyn Loss>>;

    /// Build a metric function for one split
    fn build_metric(
        &self,
        config: &RunConfig,
        split: DataSplit,
        device: &Device,
    ) -> Result<Box<dyn Metric>>;

    /// Build the model
    fn build_model(&self, config: &RunConfig, device: &Device) -> Result<Box<dyn Model>>;

    /// Build the optimizer and its learning-rate schedules.
    ///
    /// `steps_per_epoch` is the effective update count per epoch, already
    /// adjusted for gradient accumulation. The optimizer must cover the
    /// model's parameters and any trainable loss parameters.
    fn build_optimizer(
        &self,
        config: &RunConfig,
        epochs: usize,
        steps_per_epoch: usize,
        model: &dyn Model,
        loss: &dyn Loss,
    ) -> Result<(Box<dyn Optimizer>, Vec<Box<dyn LrScheduler>>)>;

    /// Fetch pretrained parameters from a remote location.
    ///
    /// Local paths never reach this; the builder loads them directly.
    fn fetch_remote_weights(
        &self,
        url: &str,
        device: &Device,
    ) -> Result<HashMap<String, Tensor>> {
        let _ = device;
        Err(Error::build(format!(
            "remote weights are not supported by this factory (requested {url})"
        )))
    }
}
