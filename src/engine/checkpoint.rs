//! Checkpoint persistence
//!
//! Each checkpoint is a full snapshot, keyed by prefix under
//! `{output_dir}/{arch_name}/{prefix}/`: model parameters as safetensors,
//! optimizer state and a manifest (carrying the best-metric record) as JSON,
//! plus optional EMA and loss parameters. `latest` is overwritten every
//! epoch; multiple prefixes coexist in the same run directory. Durability is
//! not verified; single-writer discipline (coordinating rank only) avoids
//! write races.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::components::{Loss, Model, Optimizer};
use crate::error::{Error, Result};

const MODEL_FILENAME: &str = "model.safetensors";
const EMA_FILENAME: &str = "ema.safetensors";
const LOSS_FILENAME: &str = "loss.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Best-metric record for a model candidate.
///
/// `metric` is monotonically non-decreasing across a run and `epoch` is the
/// epoch at which that value was first reached. The initial value loses to
/// any real evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    /// Best observed value of the selection metric
    pub metric: f64,
    /// Epoch at which it was first observed
    pub epoch: usize,
}

impl Default for BestRecord {
    fn default() -> Self {
        Self {
            metric: -1.0,
            epoch: 0,
        }
    }
}

impl BestRecord {
    /// Record `metric` at `epoch` if it improves on the best so far
    pub fn observe(&mut self, metric: f64, epoch: usize) -> bool {
        if metric > self.metric {
            self.metric = metric;
            self.epoch = epoch;
            true
        } else {
            false
        }
    }
}

/// Per-checkpoint manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Prefix tag (`best_model`, `best_model_ema`, `epoch_{n}`, `latest`)
    pub prefix: String,
    /// Architecture name
    pub arch: String,
    /// Best-metric record at save time
    pub best: BestRecord,
    /// Global step counter at save time
    pub global_step: usize,
    /// Save timestamp
    pub saved_at: DateTime<Utc>,
    /// Whether EMA parameters are included
    pub has_ema: bool,
    /// Whether loss parameters are included
    pub has_loss_params: bool,
}

/// Everything one snapshot persists
pub struct SaveRequest<'a> {
    /// Run directory (`{output_dir}/{arch_name}`)
    pub run_dir: &'a Path,
    /// Architecture name for the manifest
    pub arch_name: &'a str,
    /// Prefix tag
    pub prefix: &'a str,
    /// Model to snapshot
    pub model: &'a dyn Model,
    /// Optimizer state, when training
    pub optimizer: Option<&'a dyn Optimizer>,
    /// Best-metric record
    pub best: BestRecord,
    /// Global step counter
    pub global_step: usize,
    /// EMA shadow parameters, when tracked
    pub ema: Option<&'a dyn Model>,
    /// Loss with trainable parameters, when any
    pub loss: Option<&'a dyn Loss>,
}

/// Persist one full snapshot, overwriting any previous one under the prefix
pub fn save(request: &SaveRequest<'_>) -> Result<PathBuf> {
    let dir = request.run_dir.join(request.prefix);
    std::fs::create_dir_all(&dir)?;

    candle_core::safetensors::save(&request.model.state()?, dir.join(MODEL_FILENAME))?;

    if let Some(optimizer) = request.optimizer {
        let state = optimizer.state_dict()?;
        std::fs::write(
            dir.join(OPTIMIZER_FILENAME),
            serde_json::to_string_pretty(&state)?,
        )?;
    }

    let mut has_ema = false;
    if let Some(ema) = request.ema {
        candle_core::safetensors::save(&ema.state()?, dir.join(EMA_FILENAME))?;
        has_ema = true;
    }

    let mut has_loss_params = false;
    if let Some(loss) = request.loss {
        let params = loss.trainable_parameters();
        if !params.is_empty() {
            candle_core::safetensors::save(&params, dir.join(LOSS_FILENAME))?;
            has_loss_params = true;
        }
    }

    let manifest = CheckpointManifest {
        prefix: request.prefix.to_string(),
        arch: request.arch_name.to_string(),
        best: request.best,
        global_step: request.global_step,
        saved_at: Utc::now(),
        has_ema,
        has_loss_params,
    };
    std::fs::write(
        dir.join(MANIFEST_FILENAME),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    info!(prefix = request.prefix, dir = %dir.display(), "checkpoint saved");
    Ok(dir)
}

/// Read a checkpoint manifest without restoring anything
pub fn read_manifest(dir: &Path) -> Result<CheckpointManifest> {
    let raw = std::fs::read_to_string(dir.join(MANIFEST_FILENAME)).map_err(|err| {
        Error::checkpoint(format!(
            "cannot read manifest in {}: {err}",
            dir.display()
        ))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Restore a full snapshot into the given components.
///
/// Returns the persisted best-metric record so the epoch loop can resume at
/// `best.epoch + 1`.
pub fn restore(
    dir: &Path,
    device: &Device,
    model: &mut dyn Model,
    optimizer: Option<&mut (dyn Optimizer + '_)>,
    loss: Option<&mut (dyn Loss + '_)>,
    ema: Option<&mut (dyn Model + '_)>,
) -> Result<CheckpointManifest> {
    let manifest = read_manifest(dir)?;

    let weights: HashMap<String, Tensor> =
        candle_core::safetensors::load(dir.join(MODEL_FILENAME), device)?;
    model.load_state(&weights)?;

    if let Some(optimizer) = optimizer {
        let path = dir.join(OPTIMIZER_FILENAME);
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            optimizer.load_state_dict(serde_json::from_str(&raw)?)?;
        }
    }

    if let Some(loss) = loss {
        if manifest.has_loss_params {
            let params = candle_core::safetensors::load(dir.join(LOSS_FILENAME), device)?;
            loss.load_state(&params)?;
        }
    }

    if let Some(ema) = ema {
        if manifest.has_ema {
            let params = candle_core::safetensors::load(dir.join(EMA_FILENAME), device)?;
            ema.load_state(&params)?;
        }
    }

    info!(
        dir = %dir.display(),
        epoch = manifest.best.epoch,
        metric = manifest.best.metric,
        "checkpoint restored"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::baseline::BaselineFactory;
    use crate::components::ComponentFactory;
    use crate::config::RunConfig;
    use tempfile::TempDir;

    fn toy_config() -> RunConfig {
        RunConfig::from_yaml(
            r#"
Global:
  epochs: 1
  seed: 11
Arch:
  name: toy_linear
  feature_dim: 4
  num_classes: 3
"#,
        )
        .unwrap()
    }

    #[test]
    fn best_record_is_monotonic() {
        let mut best = BestRecord::default();
        assert!(best.observe(0.5, 1));
        assert!(!best.observe(0.5, 2));
        assert!(!best.observe(0.4, 3));
        assert!(best.observe(0.6, 4));
        assert_eq!(best.epoch, 4);
        assert_eq!(best.metric, 0.6);
    }

    #[test]
    fn default_record_loses_to_any_evaluation() {
        let mut best = BestRecord::default();
        assert!(best.observe(0.0, 1));
    }

    #[test]
    fn snapshot_roundtrip_restores_parameters_and_record() {
        let config = toy_config();
        let factory = BaselineFactory::new();
        let device = Device::Cpu;
        let model = factory.build_model(&config, &device).unwrap();
        let dir = TempDir::new().unwrap();

        let best = BestRecord {
            metric: 0.72,
            epoch: 5,
        };
        let request = SaveRequest {
            run_dir: dir.path(),
            arch_name: "toy_linear",
            prefix: "latest",
            model: model.as_ref(),
            optimizer: None,
            best,
            global_step: 120,
            ema: None,
            loss: None,
        };
        let saved = save(&request).unwrap();
        assert!(saved.join("model.safetensors").exists());
        assert!(saved.join("manifest.json").exists());

        // Restore into a freshly built (differently seeded) model.
        let mut other_config = toy_config();
        other_config.global.seed = Some(99);
        let mut restored_model = factory.build_model(&other_config, &device).unwrap();
        let manifest = restore(
            &saved,
            &device,
            restored_model.as_mut(),
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(manifest.best, best);
        assert_eq!(manifest.global_step, 120);

        let a = model.state().unwrap();
        let b = restored_model.state().unwrap();
        for (name, tensor) in a {
            let lhs = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let rhs = b[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(lhs, rhs);
        }
    }

    #[test]
    fn restore_reattaches_optimizer_and_ema_state() {
        let config = toy_config();
        let factory = BaselineFactory::new();
        let device = Device::Cpu;
        let model = factory.build_model(&config, &device).unwrap();
        let loss = factory
            .build_loss(&config, crate::components::DataSplit::Train, &device)
            .unwrap();
        let (mut optimizer, _) = factory
            .build_optimizer(&config, 1, 1, model.as_ref(), loss.as_ref())
            .unwrap();
        optimizer.set_learning_rate(0.25);
        let shadow = factory.build_model(&config, &device).unwrap();
        let dir = TempDir::new().unwrap();

        let request = SaveRequest {
            run_dir: dir.path(),
            arch_name: "toy_linear",
            prefix: "latest",
            model: model.as_ref(),
            optimizer: Some(optimizer.as_ref()),
            best: BestRecord::default(),
            global_step: 7,
            ema: Some(shadow.as_ref()),
            loss: Some(loss.as_ref()),
        };
        let saved = save(&request).unwrap();

        let mut other_config = toy_config();
        other_config.global.seed = Some(99);
        let mut restored_model = factory.build_model(&other_config, &device).unwrap();
        let mut restored_shadow = factory.build_model(&other_config, &device).unwrap();
        let (mut restored_optimizer, _) = factory
            .build_optimizer(&other_config, 1, 1, restored_model.as_ref(), loss.as_ref())
            .unwrap();

        let manifest = restore(
            &saved,
            &device,
            restored_model.as_mut(),
            Some(restored_optimizer.as_mut()),
            None,
            Some(restored_shadow.as_mut()),
        )
        .unwrap();
        assert!(manifest.has_ema);
        assert!(!manifest.has_loss_params);
        assert_eq!(restored_optimizer.learning_rate(), 0.25);

        let expected = shadow.state().unwrap()["fc.bias"].to_vec1::<f32>().unwrap();
        let loaded = restored_shadow.state().unwrap()["fc.bias"]
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(expected, loaded);
    }

    #[test]
    fn prefixes_coexist_under_one_run_dir() {
        let config = toy_config();
        let factory = BaselineFactory::new();
        let device = Device::Cpu;
        let model = factory.build_model(&config, &device).unwrap();
        let dir = TempDir::new().unwrap();

        for prefix in ["best_model", "best_model_ema", "epoch_2", "latest"] {
            let request = SaveRequest {
                run_dir: dir.path(),
                arch_name: "toy_linear",
                prefix,
                model: model.as_ref(),
                optimizer: None,
                best: BestRecord::default(),
                global_step: 0,
                ema: None,
                loss: None,
            };
            save(&request).unwrap();
        }
        for prefix in ["best_model", "best_model_ema", "epoch_2", "latest"] {
            assert!(read_manifest(&dir.path().join(prefix)).is_ok());
        }
    }
}
