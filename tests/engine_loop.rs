//! End-to-end tests of the epoch loop: evaluation cadence, best-model
//! selection for the primary and EMA candidates, checkpoint resume, and
//! run-to-run determinism.

use std::collections::VecDeque;
use std::path::PathBuf;

use tempfile::TempDir;
use vistrain::components::baseline::{BaselineFactory, ClassificationOps};
use vistrain::engine::{read_manifest, Engine, EpochOps, EvalContext, LocalGroup, RuntimeCapabilities, TrainContext};
use vistrain::error::Result;
use vistrain::{RunConfig, RunMode};

/// Epoch operations with a scripted evaluation sequence.
///
/// Training epochs are no-ops; evaluation pops the next scripted value, so a
/// test controls exactly which epochs improve the best metric.
struct ScriptedOps {
    evals: VecDeque<f64>,
    eval_calls: Vec<(usize, f64)>,
    train_epochs: Vec<usize>,
}

impl ScriptedOps {
    fn new(evals: impl IntoIterator<Item = f64>) -> Self {
        Self {
            evals: evals.into_iter().collect(),
            eval_calls: Vec::new(),
            train_epochs: Vec::new(),
        }
    }
}

impl EpochOps for ScriptedOps {
    fn train_epoch(&mut self, ctx: &mut TrainContext<'_>) -> Result<()> {
        self.train_epochs.push(ctx.epoch);
        Ok(())
    }

    fn eval_epoch(&mut self, ctx: &mut EvalContext<'_>) -> Result<f64> {
        let value = self.evals.pop_front().unwrap_or(0.0);
        self.eval_calls.push((ctx.epoch, value));
        Ok(value)
    }
}

/// Records the evaluation sequence of real epoch operations
struct RecordingOps<T> {
    inner: T,
    evals: Vec<f64>,
}

impl<T: EpochOps> EpochOps for RecordingOps<T> {
    fn train_epoch(&mut self, ctx: &mut TrainContext<'_>) -> Result<()> {
        self.inner.train_epoch(ctx)
    }

    fn eval_epoch(&mut self, ctx: &mut EvalContext<'_>) -> Result<f64> {
        let value = self.inner.eval_epoch(ctx)?;
        self.evals.push(value);
        Ok(value)
    }
}

fn base_config(output_dir: PathBuf) -> RunConfig {
    let mut config = RunConfig::from_yaml(
        r#"
Global:
  epochs: 4
  seed: 5
  eval_during_train: true
Arch:
  name: toy_linear
  feature_dim: 6
  num_classes: 3
DataLoader:
  Train:
    batch_size: 8
    num_batches: 4
  Eval:
    batch_size: 8
    num_batches: 2
Loss:
  Train:
    name: CrossEntropy
  Eval:
    name: CrossEntropy
Metric:
  Train:
    name: TopkAcc
  Eval:
    name: TopkAcc
Optimizer:
  name: Momentum
  lr: 0.5
"#,
    )
    .unwrap();
    config.global.output_dir = output_dir;
    config
}

fn build_engine(config: RunConfig, mode: RunMode) -> Engine {
    let factory = BaselineFactory::new();
    let group = LocalGroup::solo();
    let capabilities = RuntimeCapabilities::host();
    Engine::new(config, mode, &factory, &group, &capabilities).unwrap()
}

#[test]
fn evaluation_follows_interval_and_start_epoch() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.global.epochs = 6;
    config.global.eval_interval = 2;
    config.global.start_eval_epoch = 2;

    let mut engine = build_engine(config, RunMode::Train);
    let mut ops = ScriptedOps::new([0.1, 0.2]);
    let best = engine.train(&mut ops).unwrap();

    assert_eq!(ops.train_epochs, vec![1, 2, 3, 4, 5, 6]);
    let eval_epochs: Vec<usize> = ops.eval_calls.iter().map(|(e, _)| *e).collect();
    assert_eq!(eval_epochs, vec![4, 6]);
    assert_eq!(best.metric, 0.2);
    assert_eq!(best.epoch, 6);
}

#[test]
fn best_checkpoint_only_advances_on_strict_improvement() {
    let dir = TempDir::new().unwrap();
    let config = base_config(dir.path().to_path_buf());
    let run_dir = config.run_dir();

    let mut engine = build_engine(config, RunMode::Train);
    let mut ops = ScriptedOps::new([0.5, 0.4, 0.6, 0.6]);
    let best = engine.train(&mut ops).unwrap();

    assert_eq!(best.metric, 0.6);
    assert_eq!(best.epoch, 3);

    let manifest = read_manifest(&run_dir.join("best_model")).unwrap();
    assert_eq!(manifest.best.metric, 0.6);
    assert_eq!(manifest.best.epoch, 3);
}

#[test]
fn ema_best_is_selected_independently() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.global.epochs = 3;
    config.ema = Some(serde_yaml::from_str("decay: 0.9").unwrap());
    let run_dir = config.run_dir();

    let mut engine = build_engine(config, RunMode::Train);
    // Calls alternate primary, EMA within each epoch.
    let mut ops = ScriptedOps::new([0.5, 0.3, 0.4, 0.6, 0.45, 0.55]);
    engine.train(&mut ops).unwrap();

    assert_eq!(engine.best().metric, 0.5);
    assert_eq!(engine.best().epoch, 1);
    assert_eq!(engine.best_ema().metric, 0.6);
    assert_eq!(engine.best_ema().epoch, 2);

    let primary = read_manifest(&run_dir.join("best_model")).unwrap();
    assert_eq!(primary.best.epoch, 1);
    let ema = read_manifest(&run_dir.join("best_model_ema")).unwrap();
    assert_eq!(ema.best.epoch, 2);
}

#[test]
fn resume_continues_after_the_recorded_epoch() {
    let dir = TempDir::new().unwrap();
    let mut first = base_config(dir.path().to_path_buf());
    first.global.epochs = 5;
    let run_dir = first.run_dir();

    let mut engine = build_engine(first, RunMode::Train);
    let mut ops = ScriptedOps::new([0.1, 0.2, 0.3, 0.4, 0.5]);
    engine.train(&mut ops).unwrap();
    assert_eq!(ops.train_epochs.len(), 5);

    let mut resumed = base_config(dir.path().to_path_buf());
    resumed.global.epochs = 10;
    resumed.global.checkpoints = Some(run_dir.join("latest"));

    let mut engine = build_engine(resumed, RunMode::Train);
    let mut ops = ScriptedOps::new([0.6, 0.7, 0.8, 0.9, 1.0]);
    engine.train(&mut ops).unwrap();
    assert_eq!(ops.train_epochs, vec![6, 7, 8, 9, 10]);
}

#[test]
fn identical_configurations_evaluate_identically() {
    let run = || {
        let dir = TempDir::new().unwrap();
        let config = base_config(dir.path().to_path_buf());
        let mut engine = build_engine(config, RunMode::Train);
        let mut ops = RecordingOps {
            inner: ClassificationOps::new(),
            evals: Vec::new(),
        };
        let best = engine.train(&mut ops).unwrap();
        (best, ops.evals)
    };

    let (best_a, evals_a) = run();
    let (best_b, evals_b) = run();
    assert_eq!(best_a, best_b);
    assert!(!evals_a.is_empty());
    assert_eq!(evals_a, evals_b);
}

#[test]
fn training_beats_chance_on_the_synthetic_task() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.global.epochs = 8;
    config
        .dataloader
        .insert("Train".into(), serde_yaml::from_str("{batch_size: 16, num_batches: 10}").unwrap());

    let mut engine = build_engine(config, RunMode::Train);
    let mut ops = ClassificationOps::new();
    let best = engine.train(&mut ops).unwrap();

    // Chance on three balanced classes is about 1/3.
    assert!(best.metric > 0.35, "best metric {} not above chance", best.metric);
}

#[test]
fn accumulation_groups_step_the_optimizer_once() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.global.epochs = 2;
    config.global.update_freq = 4;
    config.global.eval_during_train = false;
    config.dataloader.insert(
        "Train".into(),
        serde_yaml::from_str("{batch_size: 4, num_batches: 9}").unwrap(),
    );

    let mut engine = build_engine(config, RunMode::Train);
    let mut ops = ClassificationOps::new();
    engine.train(&mut ops).unwrap();

    // 9 batches floor to 8 usable iterations, so each epoch applies exactly
    // two optimizer steps.
    assert_eq!(engine.global_step(), 4);
}

#[test]
fn trailing_partial_group_takes_no_step() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.global.epochs = 1;
    config.global.update_freq = 4;
    config.global.iter_per_epoch = Some(12);
    config.global.eval_during_train = false;
    config.dataloader.insert(
        "Train".into(),
        serde_yaml::from_str("{batch_size: 4, num_batches: 9}").unwrap(),
    );

    let mut engine = build_engine(config, RunMode::Train);
    let mut ops = ClassificationOps::new();
    engine.train(&mut ops).unwrap();

    // The loader runs dry after 9 batches: two full groups step, the ninth
    // batch never closes a group and must not step.
    assert_eq!(engine.global_step(), 2);
}

#[test]
fn standalone_eval_produces_the_selection_scalar() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.global.eval_during_train = false;

    let mut engine = build_engine(config, RunMode::Eval);
    let mut ops = ClassificationOps::new();
    let metric = engine.eval(&mut ops).unwrap();
    assert!((0.0..=1.0).contains(&metric));
}
