//! Built-in baseline collaborators
//!
//! A small synthetic classification stack used by the bundled CLI and by the
//! engine's own integration tests: a deterministic in-memory dataloader, a
//! linear classifier, cross-entropy loss, top-1 accuracy, plain SGD with
//! optional learning-rate schedules, and the classification epoch operations.
//!
//! Everything here is seeded from `Global.seed`, so two runs with the same
//! configuration produce identical batches, parameters, and metric sequences.

use std::cell::RefCell;
use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::engine::trainer::{EpochOps, EvalContext, TrainContext};
use crate::error::{Error, Result};

use super::{
    Batch, ComponentFactory, DataLoader, DataSplit, Loss, LrScheduler, Metric, Model,
    ModelOutput, Optimizer,
};

const ARCH_NAME: &str = "toy_linear";

fn yaml_usize(section: Option<&serde_yaml::Value>, key: &str, default: usize) -> Result<usize> {
    match section.and_then(|v| v.get(key)) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| Error::config(format!("'{key}' must be a non-negative integer"))),
    }
}

fn yaml_bool(section: Option<&serde_yaml::Value>, key: &str, default: bool) -> Result<bool> {
    match section.and_then(|v| v.get(key)) {
        None => Ok(default),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| Error::config(format!("'{key}' must be a boolean"))),
    }
}

fn yaml_f64(section: Option<&serde_yaml::Value>, key: &str, default: f64) -> Result<f64> {
    match section.and_then(|v| v.get(key)) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| Error::config(format!("'{key}' must be a number"))),
    }
}

/// Factory for the baseline stack.
///
/// The factory keeps aliases to the parameters of the most recently built
/// model so the optimizer can attach to them; the builder always constructs
/// the optimizer right after the model it trains.
pub struct BaselineFactory {
    attached: RefCell<Vec<(String, Var)>>,
}

impl BaselineFactory {
    /// A fresh factory with no parameters attached
    pub fn new() -> Self {
        Self {
            attached: RefCell::new(Vec::new()),
        }
    }

    fn shape(&self, config: &RunConfig) -> Result<(usize, usize)> {
        let options = serde_yaml::to_value(&config.arch.options)?;
        let feature_dim = yaml_usize(Some(&options), "feature_dim", 8)?;
        let num_classes = yaml_usize(Some(&options), "num_classes", 4)?;
        if num_classes == 0 || feature_dim < num_classes {
            return Err(Error::config(
                "toy_linear needs num_classes >= 1 and feature_dim >= num_classes",
            ));
        }
        Ok((feature_dim, num_classes))
    }
}

impl Default for BaselineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for BaselineFactory {
    fn build_dataloader(
        &self,
        config: &RunConfig,
        split: DataSplit,
        device: &Device,
    ) -> Result<Box<dyn DataLoader>> {
        let (feature_dim, num_classes) = self.shape(config)?;
        let key = match split {
            DataSplit::Train => "Train",
            DataSplit::Eval => "Eval",
        };
        let section = config
            .dataloader
            .get(key)
            .cloned()
            .unwrap_or(serde_yaml::Value::Null);
        let batch_size = yaml_usize(Some(&section), "batch_size", 8)?;
        let num_batches = yaml_usize(Some(&section), "num_batches", 8)?;
        let tail_exact = yaml_bool(Some(&section), "tail_batch_exact", true)?;

        // Train and eval draw from disjoint streams of the same seed.
        let base = config.global.seed.unwrap_or(0);
        let seed = match split {
            DataSplit::Train => base,
            DataSplit::Eval => base.wrapping_add(1),
        };
        let loader = SyntheticLoader::generate(
            seed,
            num_batches,
            batch_size,
            feature_dim,
            num_classes,
            tail_exact,
            device,
        )?;
        Ok(Box::new(loader))
    }

    fn build_loss(
        &self,
        _config: &RunConfig,
        _split: DataSplit,
        _device: &Device,
    ) -> Result<Box<dyn Loss>> {
        Ok(Box::new(CrossEntropyLoss))
    }

    fn build_metric(
        &self,
        _config: &RunConfig,
        _split: DataSplit,
        _device: &Device,
    ) -> Result<Box<dyn Metric>> {
        Ok(Box::new(TopOneMetric))
    }

    fn build_model(&self, config: &RunConfig, device: &Device) -> Result<Box<dyn Model>> {
        if config.arch.name != ARCH_NAME {
            return Err(Error::build(format!(
                "unknown architecture '{}', this factory only builds '{ARCH_NAME}'",
                config.arch.name
            )));
        }
        let (feature_dim, num_classes) = self.shape(config)?;
        let model = LinearModel::seeded(
            config.global.seed.unwrap_or(0),
            feature_dim,
            num_classes,
            device,
        )?;
        *self.attached.borrow_mut() = model.parameters();
        Ok(Box::new(model))
    }

    fn build_optimizer(
        &self,
        config: &RunConfig,
        epochs: usize,
        steps_per_epoch: usize,
        _model: &dyn Model,
        loss: &dyn Loss,
    ) -> Result<(Box<dyn Optimizer>, Vec<Box<dyn LrScheduler>>)> {
        if !loss.trainable_parameters().is_empty() {
            return Err(Error::build(
                "the baseline optimizer does not cover trainable loss parameters",
            ));
        }
        let params = self.attached.borrow().clone();
        if params.is_empty() {
            return Err(Error::build("build the model before the optimizer"));
        }
        debug!(
            epochs,
            steps_per_epoch,
            lr = config.optimizer.lr,
            "building baseline optimizer"
        );

        let optimizer = SgdOptimizer::new(params, config.optimizer.lr);

        let options = serde_yaml::to_value(&config.optimizer.options)?;
        let schedulers: Vec<Box<dyn LrScheduler>> = match options
            .get("lr_scheduler")
            .and_then(serde_yaml::Value::as_str)
        {
            None | Some("Constant") => {
                vec![Box::new(ConstantScheduler::new(config.optimizer.lr))]
            }
            Some("Plateau") => {
                let factor = yaml_f64(Some(&options), "factor", 0.5)?;
                let patience = yaml_usize(Some(&options), "patience", 2)?;
                vec![Box::new(PlateauScheduler::new(
                    config.optimizer.lr,
                    factor,
                    patience,
                ))]
            }
            Some(other) => {
                return Err(Error::config(format!(
                    "unknown lr_scheduler '{other}', expected Constant or Plateau"
                )))
            }
        };
        Ok((Box::new(optimizer), schedulers))
    }
}

/// Deterministic in-memory dataloader.
///
/// Inputs are uniform in [-1, 1); the target of each sample is the argmax of
/// its first `num_classes` features, so a linear model can fit the data.
pub struct SyntheticLoader {
    batches: Vec<Batch>,
    cursor: usize,
    tail_exact: bool,
}

impl SyntheticLoader {
    /// Generate all batches up front from the given seed
    pub fn generate(
        seed: u64,
        num_batches: usize,
        batch_size: usize,
        feature_dim: usize,
        num_classes: usize,
        tail_exact: bool,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut batches = Vec::with_capacity(num_batches);
        for _ in 0..num_batches {
            let mut inputs = Vec::with_capacity(batch_size * feature_dim);
            let mut targets = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                let row: Vec<f32> =
                    (0..feature_dim).map(|_| rng.random_range(-1.0..1.0)).collect();
                let label = row[..num_classes]
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(idx, _)| idx as u32)
                    .unwrap_or(0);
                inputs.extend_from_slice(&row);
                targets.push(label);
            }
            batches.push(Batch {
                inputs: Tensor::from_vec(inputs, (batch_size, feature_dim), device)?,
                targets: Tensor::from_vec(targets, batch_size, device)?,
            });
        }
        Ok(Self {
            batches,
            cursor: 0,
            tail_exact,
        })
    }
}

impl DataLoader for SyntheticLoader {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn tail_batch_exact(&self) -> bool {
        self.tail_exact
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }
}

/// Linear classifier: `logits = x W + b`
pub struct LinearModel {
    weight: Var,
    bias: Var,
    training: bool,
}

impl LinearModel {
    /// Build with parameters drawn deterministically from `seed`
    pub fn seeded(
        seed: u64,
        feature_dim: usize,
        num_classes: usize,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let weight: Vec<f32> = (0..feature_dim * num_classes)
            .map(|_| rng.random_range(-0.1..0.1))
            .collect();
        let bias: Vec<f32> = (0..num_classes).map(|_| rng.random_range(-0.1..0.1)).collect();
        Ok(Self {
            weight: Var::from_tensor(&Tensor::from_vec(
                weight,
                (feature_dim, num_classes),
                device,
            )?)?,
            bias: Var::from_tensor(&Tensor::from_vec(bias, num_classes, device)?)?,
            training: true,
        })
    }

    /// Named parameter aliases; updates through them are visible to the model
    pub fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("fc.weight".to_string(), self.weight.clone()),
            ("fc.bias".to_string(), self.bias.clone()),
        ]
    }
}

impl Model for LinearModel {
    fn forward(&self, input: &Tensor) -> Result<ModelOutput> {
        let logits = input
            .matmul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?;
        Ok(ModelOutput::Tensor(logits))
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        state.insert("fc.weight".to_string(), self.weight.as_tensor().clone());
        state.insert("fc.bias".to_string(), self.bias.as_tensor().clone());
        Ok(state)
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in [("fc.weight", &self.weight), ("fc.bias", &self.bias)] {
            let tensor = state
                .get(name)
                .ok_or_else(|| Error::checkpoint(format!("missing parameter '{name}'")))?;
            var.set(tensor)?;
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Mean cross-entropy over the batch
pub struct CrossEntropyLoss;

impl Loss for CrossEntropyLoss {
    fn compute(
        &self,
        output: &ModelOutput,
        targets: &Tensor,
    ) -> Result<(Tensor, HashMap<String, f64>)> {
        let logits = output.logits()?;
        let loss = candle_nn::loss::cross_entropy(logits, targets)?;
        let value = loss.to_scalar::<f32>()? as f64;
        let mut parts = HashMap::new();
        parts.insert("CELoss".to_string(), value);
        Ok((loss, parts))
    }
}

/// Top-1 accuracy
pub struct TopOneMetric;

impl Metric for TopOneMetric {
    fn compute(&self, output: &ModelOutput, targets: &Tensor) -> Result<HashMap<String, f64>> {
        let predictions = output.logits()?.argmax(D::Minus1)?;
        let correct = predictions
            .eq(targets)?
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()? as f64;
        let mut values = HashMap::new();
        values.insert("top1".to_string(), correct);
        Ok(values)
    }

    fn primary_key(&self) -> &str {
        "top1"
    }
}

/// Plain SGD over parameter aliases shared with the model
pub struct SgdOptimizer {
    params: Vec<(String, Var)>,
    lr: f64,
    steps: usize,
}

impl SgdOptimizer {
    /// New optimizer over the given parameter aliases
    pub fn new(params: Vec<(String, Var)>, lr: f64) -> Self {
        Self {
            params,
            lr,
            steps: 0,
        }
    }
}

impl Optimizer for SgdOptimizer {
    fn name(&self) -> &str {
        "SGD"
    }

    fn step(&mut self, grads: &GradStore, grad_scale: f64) -> Result<()> {
        for (_, var) in &self.params {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let delta = grad.affine(self.lr * grad_scale, 0.0)?;
                let updated = (var.as_tensor() - &delta)?;
                var.set(&updated)?;
            }
        }
        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step_count(&self) -> usize {
        self.steps
    }

    fn state_dict(&self) -> Result<serde_json::Value> {
        Ok(json!({ "lr": self.lr, "steps": self.steps }))
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<()> {
        self.lr = state
            .get("lr")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| Error::checkpoint("optimizer state is missing 'lr'"))?;
        self.steps = state
            .get("steps")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::checkpoint("optimizer state is missing 'steps'"))?
            as usize;
        Ok(())
    }
}

/// Fixed learning rate
pub struct ConstantScheduler {
    lr: f64,
}

impl ConstantScheduler {
    /// Schedule pinned at `lr`
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl LrScheduler for ConstantScheduler {
    fn name(&self) -> &str {
        "Constant"
    }

    fn step(&mut self, _metric: Option<f64>) {}

    fn get_lr(&self) -> f64 {
        self.lr
    }
}

/// Reduce-on-plateau: shrink the learning rate after `patience` epochs
/// without metric improvement.
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    /// New plateau schedule starting at `lr`
    pub fn new(lr: f64, factor: f64, patience: usize) -> Self {
        Self {
            lr,
            factor,
            patience,
            best: f64::NEG_INFINITY,
            bad_epochs: 0,
        }
    }
}

impl LrScheduler for PlateauScheduler {
    fn name(&self) -> &str {
        "Plateau"
    }

    fn step(&mut self, metric: Option<f64>) {
        let Some(metric) = metric else { return };
        if metric > self.best {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
            if self.bad_epochs > self.patience {
                self.lr *= self.factor;
                self.bad_epochs = 0;
            }
        }
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn by_epoch(&self) -> bool {
        true
    }

    fn metric_driven(&self) -> bool {
        true
    }
}

/// Epoch operations for supervised classification
pub struct ClassificationOps;

impl ClassificationOps {
    /// The standard classification operations
    pub fn new() -> Self {
        Self
    }

    /// Back-propagate one accumulation group and apply the update.
    ///
    /// Under dynamic loss scaling a non-finite scaled loss skips the update
    /// and backs the scale off instead.
    fn apply_update(&self, ctx: &mut TrainContext<'_>, summed: Tensor) -> Result<()> {
        let mean = summed.affine(1.0 / ctx.update_freq as f64, 0.0)?;
        let (objective, grad_scale) = match ctx.scaler.as_deref_mut() {
            Some(scaler) => (scaler.scale_loss(&mean)?, scaler.inv_scale()),
            None => (mean, 1.0),
        };
        let found_overflow = !objective.to_scalar::<f32>()?.is_finite();
        if let Some(scaler) = ctx.scaler.as_deref_mut() {
            scaler.update(found_overflow);
        }
        if found_overflow {
            warn!(
                epoch = ctx.epoch,
                "skipping update after non-finite scaled loss"
            );
            return Ok(());
        }

        let grads = objective.backward()?;
        ctx.optimizer.step(&grads, grad_scale)?;
        *ctx.global_step += 1;

        let mut stepped_lr = None;
        for scheduler in ctx.schedulers.iter_mut() {
            if !scheduler.by_epoch() {
                scheduler.step(None);
                stepped_lr = Some(scheduler.get_lr());
            }
        }
        if let Some(lr) = stepped_lr {
            ctx.optimizer.set_learning_rate(lr);
        }

        if let Some(ema) = ctx.ema.as_deref_mut() {
            ema.update(&*ctx.model)?;
        }
        Ok(())
    }
}

impl Default for ClassificationOps {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochOps for ClassificationOps {
    fn train_epoch(&mut self, ctx: &mut TrainContext<'_>) -> Result<()> {
        ctx.loader.reset();
        let mut pending: Option<Tensor> = None;
        let mut group = 0usize;
        let mut iteration = 0usize;

        while iteration < ctx.iter_per_epoch {
            let Some(batch) = ctx.loader.next_batch()? else {
                break;
            };
            iteration += 1;
            let n = batch.targets.dim(0)?;

            let output = ctx.model.forward(&batch.inputs)?;
            let (loss, parts) = ctx.loss.compute(&output, &batch.targets)?;
            for (name, value) in parts {
                ctx.stats.update(&name, value, n);
            }
            if let Some(metric) = ctx.metric {
                for (name, value) in metric.compute(&output, &batch.targets)? {
                    ctx.stats.update(&name, value, n);
                }
            }

            pending = Some(match pending.take() {
                Some(sum) => (sum + loss)?,
                None => loss,
            });
            group += 1;
            if group == ctx.update_freq {
                let summed = pending.take().ok_or_else(|| {
                    Error::precondition("accumulation group closed without a loss")
                })?;
                self.apply_update(ctx, summed)?;
                group = 0;
            }

            if iteration % ctx.print_batch_step == 0 {
                info!(
                    "[Train][Epoch {}/{}][Iter {}/{}] lr: {:.6}, {}",
                    ctx.epoch,
                    ctx.epochs,
                    iteration,
                    ctx.iter_per_epoch,
                    ctx.optimizer.learning_rate(),
                    ctx.stats.summary()
                );
            }
        }
        // A trailing partial group carries no optimizer step.
        Ok(())
    }

    fn eval_epoch(&mut self, ctx: &mut EvalContext<'_>) -> Result<f64> {
        ctx.loader.reset();
        let mut primary_sum = 0.0;
        let mut primary_weight = 0usize;
        let mut loss_sum = 0.0;
        let mut loss_weight = 0usize;

        while let Some(batch) = ctx.loader.next_batch()? {
            let n = batch.targets.dim(0)?;
            let output = ctx.model.forward(&batch.inputs)?;

            if let Some(loss) = ctx.loss {
                let (total, parts) = loss.compute(&output, &batch.targets)?;
                loss_sum += total.to_scalar::<f32>()? as f64 * n as f64;
                loss_weight += n;
                for (name, value) in parts {
                    ctx.stats.update(&name, value, n);
                }
            }
            if let Some(metric) = ctx.metric {
                let values = metric.compute(&output, &batch.targets)?;
                if let Some(&value) = values.get(metric.primary_key()) {
                    primary_sum += value * n as f64;
                    primary_weight += n;
                }
                for (name, value) in values {
                    ctx.stats.update(&name, value, n);
                }
            }
        }

        if primary_weight > 0 {
            Ok(primary_sum / primary_weight as f64)
        } else if loss_weight > 0 {
            // Without a metric, selection falls back to the negated loss so
            // that higher still means better.
            Ok(-(loss_sum / loss_weight as f64))
        } else {
            Err(Error::precondition(
                "evaluation needs a metric or a loss to produce a selection scalar",
            ))
        }
    }
}
