//! Export Pipeline
//!
//! Decorates a trained model into an inference-ready artifact: selects the
//! sub-result to export, optionally strips the task head, applies the output
//! activation, triggers structural re-parameterization hooks, and serializes
//! a fixed-input-shape artifact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::components::{Model, ModelOutput, RepLayer};
use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Output activation applied by the export decorator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// Softmax over the class axis (single-label tasks)
    Softmax,
    /// Element-wise sigmoid (multi-label tasks)
    Sigmoid,
}

/// Resolve the activation policy from the configuration.
///
/// Multi-label tasks get sigmoid; otherwise softmax unless explicitly
/// disabled with `infer_add_softmax: false`.
pub fn resolve_activation(config: &RunConfig) -> Option<OutputActivation> {
    if config.global.use_multilabel {
        Some(OutputActivation::Sigmoid)
    } else if config.arch.infer_add_softmax {
        Some(OutputActivation::Softmax)
    } else {
        None
    }
}

/// Inference decorator around a trained base model.
///
/// Wrapping is transparent composition; the base model's identity is never
/// mutated beyond the optional identity-head substitution it opts into.
pub struct ExportModel {
    base: Box<dyn Model>,
    infer_model_name: Option<String>,
    infer_output_key: Option<String>,
    activation: Option<OutputActivation>,
}

impl ExportModel {
    /// Decorate `base` according to the Arch/Global export options
    pub fn new(config: &RunConfig, mut base: Box<dyn Model>) -> Self {
        let infer_output_key = config.arch.infer_output_key.clone();
        if infer_output_key.as_deref() == Some("features") {
            // Feature extraction: the task head is dead weight if the model
            // supports substituting it.
            base.replace_head_with_identity();
        }
        Self {
            base,
            infer_model_name: config.arch.infer_model_name.clone(),
            infer_output_key,
            activation: resolve_activation(config),
        }
    }

    /// The resolved activation policy
    pub fn activation(&self) -> Option<OutputActivation> {
        self.activation
    }

    /// Access the wrapped base model
    pub fn base(&self) -> &dyn Model {
        self.base.as_ref()
    }

    /// Access the wrapped base model, mutable
    pub fn base_mut(&mut self) -> &mut dyn Model {
        self.base.as_mut()
    }

    fn shape_output(&self, output: ModelOutput) -> Result<Tensor> {
        let mut current = &output;
        if let Some(name) = &self.infer_model_name {
            current = current.get(name).ok_or_else(|| {
                Error::export(format!("base model has no sub-result named '{name}'"))
            })?;
        }
        if let Some(key) = &self.infer_output_key {
            if let Some(selected) = current.get(key) {
                current = selected;
            }
        }
        let logits = match self.activation {
            // Activation applies to the logits sub-key of structured outputs.
            Some(_) => current.logits()?,
            None => match current.as_tensor() {
                Some(t) => t,
                None => current.logits()?,
            },
        };
        match self.activation {
            Some(OutputActivation::Softmax) => Ok(candle_nn::ops::softmax(logits, D::Minus1)?),
            Some(OutputActivation::Sigmoid) => Ok(candle_nn::ops::sigmoid(logits)?),
            None => Ok(logits.clone()),
        }
    }
}

impl Model for ExportModel {
    fn forward(&self, input: &Tensor) -> Result<ModelOutput> {
        let output = self.base.forward(input)?;
        Ok(ModelOutput::Tensor(self.shape_output(output)?))
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        self.base.state()
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        self.base.load_state(state)
    }

    fn set_training(&mut self, training: bool) {
        self.base.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.base.is_training()
    }

    fn rep_sublayers(&mut self) -> Vec<&mut dyn RepLayer> {
        self.base.rep_sublayers()
    }

    fn is_quantized(&self) -> bool {
        self.base.is_quantized()
    }
}

/// Fixed-input-shape description stored next to the exported parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Architecture name
    pub arch: String,
    /// Per-sample input shape (batch dimension is free)
    pub input_shape: Vec<usize>,
    /// Input dtype of the serialized graph
    pub input_dtype: String,
    /// Output activation baked into the artifact
    pub activation: Option<OutputActivation>,
    /// Whether the quantized export path was taken
    pub quantized: bool,
}

/// Trigger re-parameterization hooks on every sublayer that supports them.
///
/// The transform is one-time; already-repped layers are skipped. Returns how
/// many layers were transformed.
pub fn apply_rep_hooks(model: &mut dyn Model) -> Result<usize> {
    let mut applied = 0;
    for layer in model.rep_sublayers() {
        if !layer.is_repped() {
            layer.rep()?;
            applied += 1;
        }
    }
    Ok(applied)
}

/// Serialize a decorated model as a deployable artifact.
///
/// Writes `{save_inference_dir}/inference.safetensors` plus a JSON manifest;
/// the quantized branch uses the `inference_int8` stem instead.
pub fn serialize_artifact(
    config: &RunConfig,
    model: &ExportModel,
    out_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let stem = if model.is_quantized() {
        "inference_int8"
    } else {
        "inference"
    };

    candle_core::safetensors::save(
        &model.state()?,
        out_dir.join(format!("{stem}.safetensors")),
    )?;

    let manifest = ExportManifest {
        arch: config.arch.name.clone(),
        input_shape: config.global.image_shape.clone(),
        input_dtype: "float32".to_string(),
        activation: model.activation(),
        quantized: model.is_quantized(),
    };
    std::fs::write(
        out_dir.join(format!("{stem}.json")),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    let path = out_dir.join(stem);
    info!(artifact = %path.display(), "export succeeded");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    struct StubModel {
        output: ModelOutput,
        training: bool,
        repped: Vec<StubRepLayer>,
        head_replaced: std::sync::Arc<std::sync::atomic::AtomicBool>,
        quantized: bool,
    }

    struct StubRepLayer {
        repped: bool,
    }

    impl RepLayer for StubRepLayer {
        fn is_repped(&self) -> bool {
            self.repped
        }

        fn rep(&mut self) -> Result<()> {
            self.repped = true;
            Ok(())
        }
    }

    impl StubModel {
        fn with_output(output: ModelOutput) -> Self {
            Self {
                output,
                training: true,
                repped: Vec::new(),
                head_replaced: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
                quantized: false,
            }
        }
    }

    impl Model for StubModel {
        fn forward(&self, _input: &Tensor) -> Result<ModelOutput> {
            Ok(self.output.clone())
        }

        fn state(&self) -> Result<HashMap<String, Tensor>> {
            let mut state = HashMap::new();
            state.insert(
                "w".to_string(),
                Tensor::from_vec(vec![1.0f32, 2.0], (2,), &Device::Cpu)?,
            );
            Ok(state)
        }

        fn load_state(&mut self, _state: &HashMap<String, Tensor>) -> Result<()> {
            Ok(())
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }

        fn rep_sublayers(&mut self) -> Vec<&mut dyn RepLayer> {
            self.repped
                .iter_mut()
                .map(|layer| layer as &mut dyn RepLayer)
                .collect()
        }

        fn replace_head_with_identity(&mut self) -> bool {
            self.head_replaced
                .store(true, std::sync::atomic::Ordering::SeqCst);
            true
        }

        fn is_quantized(&self) -> bool {
            self.quantized
        }
    }

    fn config_from(global_extra: &str, arch_extra: &str) -> RunConfig {
        let raw = format!(
            "Global:\n  epochs: 1\n{global_extra}Arch:\n  name: toy_linear\n{arch_extra}"
        );
        RunConfig::from_yaml(&raw).unwrap()
    }

    fn logits_output() -> (ModelOutput, Tensor) {
        let logits = Tensor::from_vec(vec![0.0f32, 1.0, 2.0], (1, 3), &Device::Cpu).unwrap();
        (ModelOutput::Tensor(logits.clone()), logits)
    }

    #[test]
    fn multilabel_selects_sigmoid() {
        let config = config_from("  use_multilabel: true\n", "");
        assert_eq!(resolve_activation(&config), Some(OutputActivation::Sigmoid));
    }

    #[test]
    fn softmax_disabled_means_no_activation() {
        let config = config_from("", "  infer_add_softmax: false\n");
        assert_eq!(resolve_activation(&config), None);

        let (output, raw_logits) = logits_output();
        let model = ExportModel::new(&config, Box::new(StubModel::with_output(output)));
        let input = Tensor::zeros((1, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let shaped = model.forward(&input).unwrap();
        let shaped = shaped.as_tensor().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(shaped, raw_logits.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn default_is_softmax_and_normalizes() {
        let config = config_from("", "");
        assert_eq!(resolve_activation(&config), Some(OutputActivation::Softmax));

        let (output, _) = logits_output();
        let model = ExportModel::new(&config, Box::new(StubModel::with_output(output)));
        let input = Tensor::zeros((1, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let shaped = model.forward(&input).unwrap();
        let row = &shaped.as_tensor().unwrap().to_vec2::<f32>().unwrap()[0];
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn distillation_branch_and_logits_key_are_selected() {
        let (tensor_output, _) = logits_output();
        let mut student = HashMap::new();
        student.insert("logits".to_string(), tensor_output);
        let mut branches = HashMap::new();
        branches.insert("Student".to_string(), ModelOutput::Named(student));
        let output = ModelOutput::Named(branches);

        let config = config_from("", "  infer_model_name: Student\n");
        let model = ExportModel::new(&config, Box::new(StubModel::with_output(output)));
        let input = Tensor::zeros((1, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward(&input).is_ok());
    }

    #[test]
    fn features_key_replaces_head() {
        let (output, _) = logits_output();
        let stub = StubModel::with_output(output);
        let replaced = stub.head_replaced.clone();
        let config = config_from("", "  infer_output_key: features\n");
        let _model = ExportModel::new(&config, Box::new(stub));
        assert!(replaced.load(std::sync::atomic::Ordering::SeqCst));

        let (output, _) = logits_output();
        let stub = StubModel::with_output(output);
        let replaced = stub.head_replaced.clone();
        let config = config_from("", "  infer_output_key: logits\n");
        let _model = ExportModel::new(&config, Box::new(stub));
        assert!(!replaced.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn rep_hooks_are_idempotent() {
        let (output, _) = logits_output();
        let mut stub = StubModel::with_output(output);
        stub.repped = vec![StubRepLayer { repped: false }, StubRepLayer { repped: true }];
        let applied = apply_rep_hooks(&mut stub).unwrap();
        assert_eq!(applied, 1);
        let applied_again = apply_rep_hooks(&mut stub).unwrap();
        assert_eq!(applied_again, 0);
    }

    #[test]
    fn artifact_uses_int8_stem_when_quantized() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config_from("", "");
        let (output, _) = logits_output();
        let mut stub = StubModel::with_output(output);
        stub.quantized = true;
        let model = ExportModel::new(&config, Box::new(stub));
        let path = serialize_artifact(&config, &model, dir.path()).unwrap();
        assert!(path.ends_with("inference_int8"));
        assert!(dir.path().join("inference_int8.safetensors").exists());
        assert!(dir.path().join("inference_int8.json").exists());
    }
}
