//! Epoch loop and checkpoint policy
//!
//! The top-level scheduler: sequences training epochs, evaluation on its
//! cadence, best-model selection (primary and EMA independently), and
//! periodic/latest checkpoints. Concrete epoch math is injected through the
//! two-method [`EpochOps`] contract; the engine never branches on the
//! concrete variant type.

use std::path::PathBuf;

use candle_core::Device;
use tracing::info;

use crate::components::{
    ComponentFactory, DataLoader, Loss, LrScheduler, Metric, Model, Optimizer,
};
use crate::config::{RunConfig, RunMode};
use crate::engine::builder::{build_components, ComponentSet};
use crate::engine::checkpoint::{self, BestRecord, SaveRequest};
use crate::engine::distributed::{self, ProcessGroup, ResolvedRunState};
use crate::engine::ema::EmaTracker;
use crate::engine::export::{apply_rep_hooks, serialize_artifact, ExportModel};
use crate::engine::precision::{decorate, GradScaler, PrecisionContext, PrecisionController, RuntimeCapabilities};
use crate::engine::stats::RunningStats;
use crate::error::{Error, Result};
use crate::logging::ScalarWriter;

/// The two operations every mode-specific engine variant must implement.
///
/// One full pass over the training data, and one full evaluation pass
/// producing the scalar used for best-model selection (higher is better).
pub trait EpochOps {
    /// Run one training epoch
    fn train_epoch(&mut self, ctx: &mut TrainContext<'_>) -> Result<()>;

    /// Run one evaluation pass over the given model handle
    fn eval_epoch(&mut self, ctx: &mut EvalContext<'_>) -> Result<f64>;
}

/// Everything a training epoch may touch
pub struct TrainContext<'a> {
    /// Current epoch (1-based)
    pub epoch: usize,
    /// Total configured epochs
    pub epochs: usize,
    /// Intra-epoch logging cadence, in batches
    pub print_batch_step: usize,
    /// Gradient-accumulation grouping
    pub update_freq: usize,
    /// Effective iterations this epoch
    pub iter_per_epoch: usize,
    /// Global step counter; advances once per optimizer step
    pub global_step: &'a mut usize,
    /// The active (possibly wrapped) model
    pub model: &'a mut dyn Model,
    /// Train loss
    pub loss: &'a mut dyn Loss,
    /// Train metric, when declared
    pub metric: Option<&'a dyn Metric>,
    /// Optimizer
    pub optimizer: &'a mut dyn Optimizer,
    /// Learning-rate schedules (step-granular ones advance per update)
    pub schedulers: &'a mut [Box<dyn LrScheduler>],
    /// Train dataloader
    pub loader: &'a mut dyn DataLoader,
    /// Loss scaler under mixed precision
    pub scaler: Option<&'a mut GradScaler>,
    /// EMA tracker to update after each optimizer step
    pub ema: Option<&'a mut EmaTracker>,
    /// Per-epoch statistics
    pub stats: &'a mut RunningStats,
}

/// Everything an evaluation pass may touch.
///
/// The model handle is an explicit parameter of the pass — evaluating the
/// EMA shadow goes through the same context with a different handle, never
/// through swapping shared state.
pub struct EvalContext<'a> {
    /// Epoch being evaluated (0 for standalone evaluation)
    pub epoch: usize,
    /// The model handle under evaluation
    pub model: &'a dyn Model,
    /// Eval loss, when declared
    pub loss: Option<&'a dyn Loss>,
    /// Eval metric, when declared
    pub metric: Option<&'a dyn Metric>,
    /// Eval dataloader
    pub loader: &'a mut dyn DataLoader,
    /// Per-pass statistics
    pub stats: &'a mut RunningStats,
}

/// Scoped inference context for a model handle.
///
/// Gradient tracking / training behavior is disabled for the scope's
/// duration and restored on every exit path, including failure.
pub struct InferenceScope<'a> {
    model: &'a mut dyn Model,
    was_training: bool,
}

impl<'a> InferenceScope<'a> {
    /// Enter inference mode for `model`
    pub fn new(model: &'a mut dyn Model) -> Self {
        let was_training = model.is_training();
        model.set_training(false);
        Self {
            model,
            was_training,
        }
    }

    /// The scoped model handle
    pub fn model(&self) -> &dyn Model {
        &*self.model
    }
}

impl Drop for InferenceScope<'_> {
    fn drop(&mut self) {
        self.model.set_training(self.was_training);
    }
}

/// Whether evaluation is due at `epoch`
pub fn eval_due(
    eval_during_train: bool,
    eval_interval: usize,
    start_eval_epoch: usize,
    epoch: usize,
) -> bool {
    eval_during_train && epoch % eval_interval == 0 && epoch > start_eval_epoch
}

/// Which model handle an evaluation pass runs against
enum EvalTarget {
    Primary,
    Ema,
}

/// The orchestration engine: owns the run's mutable state and sequences
/// every phase from construction to the terminal epoch.
pub struct Engine {
    config: RunConfig,
    mode: RunMode,
    device: Device,
    components: ComponentSet,
    resolved: ResolvedRunState,
    precision: Option<PrecisionContext>,
    ema: Option<EmaTracker>,
    global_step: usize,
    stats: RunningStats,
    best: BestRecord,
    best_ema: BestRecord,
    scalars: Option<ScalarWriter>,
}

impl Engine {
    /// Build all components and configure the run.
    ///
    /// Sequencing matters and is fixed: components are built first, then the
    /// distributed coordinator wraps them, then the precision controller
    /// decorates model and optimizer jointly, then the EMA shadow is cloned
    /// from the (wrapped) model.
    pub fn new(
        config: RunConfig,
        mode: RunMode,
        factory: &dyn ComponentFactory,
        group: &dyn ProcessGroup,
        capabilities: &RuntimeCapabilities,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.resolve_device()?;

        let mut components =
            build_components(&config, mode, factory, &device, group.world_size())?;
        let resolved = distributed::setup(&config, &mut components, group)?;

        let mut controller = PrecisionController::new();
        let precision = controller.resolve(&config, mode, capabilities)?;
        if let Some(context) = &precision {
            if mode == RunMode::Train {
                decorate(context, &mut components.model, &mut components.optimizer)?;
                info!(level = %context.level, amp_eval = context.amp_eval, "mixed precision resolved");
            }
        }

        let ema = if mode == RunMode::Train && config.ema.is_some() {
            let primary = components
                .model
                .as_deref()
                .ok_or_else(|| Error::precondition("model must exist before the EMA shadow"))?;
            Some(EmaTracker::new(&config, factory, &device, primary)?)
        } else {
            None
        };

        let scalars = if config.global.use_scalar_log
            && mode == RunMode::Train
            && resolved.is_coordinator()
        {
            Some(ScalarWriter::open(&config.run_dir())?)
        } else {
            None
        };

        Ok(Self {
            config,
            mode,
            device,
            components,
            resolved,
            precision,
            ema,
            global_step: 0,
            stats: RunningStats::new(),
            best: BestRecord::default(),
            best_ema: BestRecord::default(),
            scalars,
        })
    }

    /// Run mode fixed at construction
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Resolved runtime facts (topology, seed)
    pub fn resolved(&self) -> &ResolvedRunState {
        &self.resolved
    }

    /// Best-metric record for the primary model
    pub fn best(&self) -> BestRecord {
        self.best
    }

    /// Best-metric record for the EMA shadow
    pub fn best_ema(&self) -> BestRecord {
        self.best_ema
    }

    /// Global step counter
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Run the full training loop to its terminal epoch.
    ///
    /// Returns the primary best-metric record at completion.
    pub fn train(&mut self, ops: &mut dyn EpochOps) -> Result<BestRecord> {
        if self.mode != RunMode::Train {
            return Err(Error::precondition(format!(
                "train() requires train mode, engine is in {} mode",
                self.mode
            )));
        }

        if let Some(dir) = self.config.global.checkpoints.clone() {
            self.restore_from(&dir)?;
        }

        let epochs = self.config.global.epochs;
        let save_interval = self.config.global.save_interval;

        for epoch in self.best.epoch + 1..=epochs {
            self.run_train_epoch(ops, epoch)?;
            info!(
                "[Train][Epoch {}/{}][Avg] {}",
                epoch,
                epochs,
                self.stats.summary()
            );
            self.stats.reset();

            let mut acc = 0.0;
            if eval_due(
                self.config.global.eval_during_train,
                self.config.global.eval_interval,
                self.config.global.start_eval_epoch,
                epoch,
            ) {
                acc = self.eval_pass(ops, epoch, EvalTarget::Primary)?;
                self.step_epoch_schedules(acc)?;

                if self.best.observe(acc, epoch) {
                    self.save_snapshot("best_model", self.best, false)?;
                }
                info!(
                    "[Eval][Epoch {}][best metric: {:.5}]",
                    epoch, self.best.metric
                );
                self.record_scalar("eval_acc", epoch, acc)?;

                if self.ema.is_some() {
                    let acc_ema = self.eval_pass(ops, epoch, EvalTarget::Ema)?;
                    if self.best_ema.observe(acc_ema, epoch) {
                        self.save_snapshot("best_model_ema", self.best_ema, true)?;
                    }
                    info!(
                        "[Eval][Epoch {}][best metric ema: {:.5}]",
                        epoch, self.best_ema.metric
                    );
                    self.record_scalar("eval_acc_ema", epoch, acc_ema)?;
                }
            }

            let epoch_record = BestRecord {
                metric: acc,
                epoch,
            };
            if save_interval > 0 && epoch % save_interval == 0 {
                self.save_snapshot(&format!("epoch_{epoch}"), epoch_record, false)?;
            }
            self.save_snapshot("latest", epoch_record, false)?;
        }

        Ok(self.best)
    }

    /// Run one standalone evaluation pass over the primary model
    pub fn eval(&mut self, ops: &mut dyn EpochOps) -> Result<f64> {
        if !matches!(self.mode, RunMode::Train | RunMode::Eval) {
            return Err(Error::precondition(format!(
                "eval() requires train or eval mode, engine is in {} mode",
                self.mode
            )));
        }
        self.eval_pass(ops, 0, EvalTarget::Primary)
    }

    /// Export the model as an inference artifact
    pub fn export(&mut self) -> Result<PathBuf> {
        if self.mode != RunMode::Export {
            return Err(Error::precondition(format!(
                "export() requires export mode, engine is in {} mode",
                self.mode
            )));
        }
        let mut base = self
            .components
            .model
            .take()
            .ok_or_else(|| Error::precondition("model has not been built"))?;
        base.set_training(false);
        let repped = apply_rep_hooks(base.as_mut())?;
        if repped > 0 {
            info!(layers = repped, "re-parameterized sublayers for inference");
        }
        let model = ExportModel::new(&self.config, base);
        let path = serialize_artifact(
            &self.config,
            &model,
            &self.config.global.save_inference_dir,
        )?;
        self.components.model = Some(Box::new(model));
        Ok(path)
    }

    fn run_train_epoch(&mut self, ops: &mut dyn EpochOps, epoch: usize) -> Result<()> {
        let ComponentSet {
            model,
            train_loader,
            train_loss,
            train_metric,
            optimizer,
            schedulers,
            iter_per_epoch,
            ..
        } = &mut self.components;

        let model = model
            .as_deref_mut()
            .ok_or_else(|| Error::precondition("model has not been built"))?;
        model.set_training(true);

        let mut ctx = TrainContext {
            epoch,
            epochs: self.config.global.epochs,
            print_batch_step: self.config.global.print_batch_step,
            update_freq: self.config.global.update_freq,
            iter_per_epoch: *iter_per_epoch,
            global_step: &mut self.global_step,
            model,
            loss: train_loss
                .as_deref_mut()
                .ok_or_else(|| Error::precondition("train loss has not been built"))?,
            metric: train_metric.as_deref(),
            optimizer: optimizer
                .as_deref_mut()
                .ok_or_else(|| Error::precondition("optimizer has not been built"))?,
            schedulers: schedulers.as_mut_slice(),
            loader: train_loader
                .as_deref_mut()
                .ok_or_else(|| Error::precondition("train dataloader has not been built"))?,
            scaler: self.precision.as_mut().map(|p| &mut p.scaler),
            ema: self.ema.as_mut(),
            stats: &mut self.stats,
        };
        ops.train_epoch(&mut ctx)
    }

    fn eval_pass(&mut self, ops: &mut dyn EpochOps, epoch: usize, target: EvalTarget) -> Result<f64> {
        let ComponentSet {
            model,
            eval_loader,
            eval_loss,
            eval_metric,
            ..
        } = &mut self.components;

        let handle: &mut dyn Model = match target {
            EvalTarget::Primary => model
                .as_deref_mut()
                .ok_or_else(|| Error::precondition("model has not been built"))?,
            EvalTarget::Ema => self
                .ema
                .as_mut()
                .ok_or_else(|| Error::precondition("EMA shadow is not active"))?
                .model_mut(),
        };

        let value = {
            let scope = InferenceScope::new(handle);
            let mut ctx = EvalContext {
                epoch,
                model: scope.model(),
                loss: eval_loss.as_deref(),
                metric: eval_metric.as_deref(),
                loader: eval_loader
                    .as_deref_mut()
                    .ok_or_else(|| Error::precondition("eval dataloader has not been built"))?,
                stats: &mut self.stats,
            };
            ops.eval_epoch(&mut ctx)?
        };

        if !self.stats.is_empty() {
            info!("[Eval][Epoch {}][Avg] {}", epoch, self.stats.summary());
            self.stats.reset();
        }
        Ok(value)
    }

    /// Step epoch-granular, metric-driven (plateau-style) schedules and sync
    /// the resulting learning rate into the optimizer.
    fn step_epoch_schedules(&mut self, metric: f64) -> Result<()> {
        let mut stepped_lr = None;
        for scheduler in self.components.schedulers.iter_mut() {
            if scheduler.by_epoch() && scheduler.metric_driven() {
                scheduler.step(Some(metric));
                stepped_lr = Some(scheduler.get_lr());
            }
        }
        if let Some(lr) = stepped_lr {
            self.components.optimizer_mut()?.set_learning_rate(lr);
        }
        Ok(())
    }

    /// Persist a full snapshot under `prefix` (coordinating rank only).
    ///
    /// `shadow_as_model` selects the EMA shadow's parameters as the snapshot's
    /// model file, for the `best_model_ema` prefix.
    fn save_snapshot(&mut self, prefix: &str, best: BestRecord, shadow_as_model: bool) -> Result<()> {
        if !self.resolved.is_coordinator() {
            return Ok(());
        }
        let run_dir = self.config.run_dir();
        let model: &dyn Model = if shadow_as_model {
            self.ema
                .as_ref()
                .ok_or_else(|| Error::precondition("EMA shadow is not active"))?
                .model()
        } else {
            self.components
                .model
                .as_deref()
                .ok_or_else(|| Error::precondition("model has not been built"))?
        };
        let request = SaveRequest {
            run_dir: &run_dir,
            arch_name: &self.config.arch.name,
            prefix,
            model,
            optimizer: self.components.optimizer.as_deref(),
            best,
            global_step: self.global_step,
            ema: self.ema.as_ref().map(EmaTracker::model),
            loss: self.components.train_loss.as_deref(),
        };
        checkpoint::save(&request)?;
        Ok(())
    }

    /// Restore a checkpoint, recovering the best-metric record so the loop
    /// resumes at `best.epoch + 1`.
    fn restore_from(&mut self, dir: &std::path::Path) -> Result<()> {
        let ComponentSet {
            model,
            optimizer,
            train_loss,
            ..
        } = &mut self.components;
        let model = model
            .as_deref_mut()
            .ok_or_else(|| Error::precondition("model has not been built"))?;
        let manifest = checkpoint::restore(
            dir,
            &self.device,
            model,
            optimizer.as_deref_mut(),
            train_loss.as_deref_mut(),
            self.ema.as_mut().map(EmaTracker::model_mut),
        )?;
        self.best = manifest.best;
        self.global_step = manifest.global_step;
        Ok(())
    }

    fn record_scalar(&mut self, name: &str, step: usize, value: f64) -> Result<()> {
        if let Some(writer) = &mut self.scalars {
            writer.record(name, step, value)?;
        }
        Ok(())
    }
}
