//! Component Builder
//!
//! Constructs the per-run collaborator set from the declarative
//! configuration, gated by run mode and by optional sub-configuration
//! presence. Construction order matters: the optimizer needs the effective
//! iterations-per-epoch, which needs the train dataloader.

use candle_core::Device;
use tracing::{info, warn};

use crate::components::{
    ComponentFactory, DataLoader, DataSplit, Loss, LrScheduler, Metric, Model, Optimizer,
};
use crate::config::{RunConfig, RunMode};
use crate::error::{Error, Result};

/// The collaborators built for one run.
///
/// Fields are populated according to the run mode; accessing an absent
/// component is a precondition violation, not a silent default.
pub struct ComponentSet {
    /// The model; present in every mode
    pub model: Option<Box<dyn Model>>,
    /// Train-split dataloader (train mode)
    pub train_loader: Option<Box<dyn DataLoader>>,
    /// Eval-split dataloader (eval mode, or train with in-loop evaluation)
    pub eval_loader: Option<Box<dyn DataLoader>>,
    /// Train-split loss (train mode)
    pub train_loss: Option<Box<dyn Loss>>,
    /// Eval-split loss, when declared
    pub eval_loss: Option<Box<dyn Loss>>,
    /// Train-split metric, when declared
    pub train_metric: Option<Box<dyn Metric>>,
    /// Eval-split metric, when declared
    pub eval_metric: Option<Box<dyn Metric>>,
    /// Optimizer (train mode)
    pub optimizer: Option<Box<dyn Optimizer>>,
    /// Learning-rate schedules (train mode)
    pub schedulers: Vec<Box<dyn LrScheduler>>,
    /// Effective iterations per epoch after accumulation flooring
    pub iter_per_epoch: usize,
}

impl ComponentSet {
    /// The model, or a precondition error if it was never built
    pub fn model_mut(&mut self) -> Result<&mut (dyn Model + '_)> {
        let model = self
            .model
            .as_deref_mut()
            .ok_or_else(|| Error::precondition("model has not been built"))?;
        Ok(model)
    }

    /// The optimizer, or a precondition error outside train mode
    pub fn optimizer_mut(&mut self) -> Result<&mut (dyn Optimizer + '_)> {
        let optimizer = self
            .optimizer
            .as_deref_mut()
            .ok_or_else(|| Error::precondition("optimizer has not been built"))?;
        Ok(optimizer)
    }
}

/// Effective iterations per epoch.
///
/// The raw loader length loses one batch when the reader has no reliable
/// tail-batch signal, may be overridden manually for iteration-driven
/// training, and is floored to a multiple of the accumulation grouping.
pub fn effective_iterations(
    raw_len: usize,
    tail_batch_exact: bool,
    manual_override: Option<usize>,
    update_freq: usize,
) -> usize {
    let mut iters = if tail_batch_exact {
        raw_len
    } else {
        raw_len.saturating_sub(1)
    };
    if let Some(manual) = manual_override {
        iters = manual;
    }
    iters / update_freq * update_freq
}

/// Build all collaborators for `mode`.
///
/// `world_size` feeds the topology check: the shipped training strategies
/// assume a reference GPU count implied by the optimizer choice, and a
/// mismatch gets a warning that tuned hyperparameters may not transfer.
pub fn build_components(
    config: &RunConfig,
    mode: RunMode,
    factory: &dyn ComponentFactory,
    device: &Device,
    world_size: usize,
) -> Result<ComponentSet> {
    let update_freq = config.global.update_freq;
    let eval_in_loop = mode == RunMode::Train && config.global.eval_during_train;

    let mut iter_per_epoch = 0;
    let train_loader = if mode == RunMode::Train {
        let loader = factory.build_dataloader(config, DataSplit::Train, device)?;
        iter_per_epoch = effective_iterations(
            loader.num_batches(),
            loader.tail_batch_exact(),
            config.global.iter_per_epoch,
            update_freq,
        );
        Some(loader)
    } else {
        None
    };

    let eval_loader = if mode == RunMode::Eval || eval_in_loop {
        Some(factory.build_dataloader(config, DataSplit::Eval, device)?)
    } else {
        None
    };

    let train_loss = if mode == RunMode::Train {
        Some(factory.build_loss(config, DataSplit::Train, device)?)
    } else {
        None
    };

    let eval_loss = if (mode == RunMode::Eval || eval_in_loop) && config.loss.eval.is_some() {
        Some(factory.build_loss(config, DataSplit::Eval, device)?)
    } else {
        None
    };

    let metric_declared = |split: DataSplit| match (&config.metric, split) {
        (Some(section), DataSplit::Train) => section.train.is_some(),
        (Some(section), DataSplit::Eval) => section.eval.is_some(),
        (None, _) => false,
    };

    let train_metric = if mode == RunMode::Train && metric_declared(DataSplit::Train) {
        Some(factory.build_metric(config, DataSplit::Train, device)?)
    } else {
        None
    };

    let eval_metric = if (mode == RunMode::Eval || eval_in_loop) && metric_declared(DataSplit::Eval)
    {
        Some(factory.build_metric(config, DataSplit::Eval, device)?)
    } else {
        None
    };

    let mut model = factory.build_model(config, device)?;
    info!(arch = %config.arch.name, %mode, "model built");

    let mut train_loss = train_loss;
    if let Some(pretrained) = &config.global.pretrained_model {
        load_pretrained(
            pretrained,
            factory,
            device,
            model.as_mut(),
            train_loss.as_deref_mut(),
        )?;
    }

    let (optimizer, schedulers) = if mode == RunMode::Train {
        let loss = train_loss
            .as_deref()
            .ok_or_else(|| Error::precondition("train loss must exist before the optimizer"))?;
        let (optimizer, schedulers) = factory.build_optimizer(
            config,
            config.global.epochs,
            iter_per_epoch / update_freq,
            model.as_ref(),
            loss,
        )?;
        (Some(optimizer), schedulers)
    } else {
        (None, Vec::new())
    };

    if mode == RunMode::Train {
        let reference = reference_world_size(&config.optimizer.name);
        if world_size != reference {
            warn!(
                world_size,
                reference,
                "the shipped training strategy assumes {reference} processes; tuned \
                 hyperparameters (learning rate, batch size) may not transfer"
            );
        }
    }

    Ok(ComponentSet {
        model: Some(model),
        train_loader,
        eval_loader,
        train_loss,
        eval_loss,
        train_metric,
        eval_metric,
        optimizer,
        schedulers,
        iter_per_epoch,
    })
}

/// Reference process count implied by the optimizer choice
fn reference_world_size(optimizer_name: &str) -> usize {
    if optimizer_name == "AdamW" {
        8
    } else {
        4
    }
}

/// Load pretrained weights into the model and, when present, the train loss.
///
/// Remote URLs go through the factory; local paths are read as safetensors.
fn load_pretrained(
    source: &str,
    factory: &dyn ComponentFactory,
    device: &Device,
    model: &mut dyn Model,
    train_loss: Option<&mut (dyn Loss + '_)>,
) -> Result<()> {
    let weights = if source.starts_with("http://") || source.starts_with("https://") {
        factory.fetch_remote_weights(source, device)?
    } else {
        candle_core::safetensors::load(source, device)?
    };
    model.load_state(&weights)?;
    if let Some(loss) = train_loss {
        loss.load_state(&weights)?;
    }
    info!(%source, "loaded pretrained weights");
    Ok(())
}
