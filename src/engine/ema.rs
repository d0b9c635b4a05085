//! EMA Shadow Tracker
//!
//! Maintains a structurally identical shadow copy of the model whose
//! parameters follow `shadow = decay*shadow + (1-decay)*primary` after each
//! optimizer step. The shadow never receives gradients; it is evaluated as an
//! independent candidate model and keeps its own best-metric record.

use candle_core::Device;

use crate::components::{ComponentFactory, Model};
use crate::config::RunConfig;
use crate::error::{Error, Result};

/// The shadow model and its decay policy
pub struct EmaTracker {
    decay: f64,
    model: Box<dyn Model>,
}

impl EmaTracker {
    /// Build a shadow model initialized from the primary's current parameters
    pub fn new(
        config: &RunConfig,
        factory: &dyn ComponentFactory,
        device: &Device,
        primary: &dyn Model,
    ) -> Result<Self> {
        let decay = config
            .ema
            .as_ref()
            .map(|section| section.decay)
            .ok_or_else(|| Error::precondition("EMA tracker requires an EMA section"))?;
        let mut model = factory.build_model(config, device)?;
        model.load_state(&primary.state()?)?;
        model.set_training(false);
        Ok(Self { decay, model })
    }

    /// Decay applied per update
    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Blend the primary's parameters into the shadow; call once per optimizer step
    pub fn update(&mut self, primary: &dyn Model) -> Result<()> {
        let primary_state = primary.state()?;
        let mut shadow_state = self.model.state()?;
        for (name, shadow) in shadow_state.iter_mut() {
            let latest = primary_state.get(name).ok_or_else(|| {
                Error::precondition(format!("primary model lost parameter '{name}'"))
            })?;
            let decayed = shadow.affine(self.decay, 0.0)?;
            let blended = (decayed + latest.affine(1.0 - self.decay, 0.0)?)?;
            *shadow = blended;
        }
        self.model.load_state(&shadow_state)
    }

    /// The shadow as a read-only candidate model
    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    /// The shadow, mutable (for inference-mode scoping and checkpoint restore)
    pub fn model_mut(&mut self) -> &mut dyn Model {
        self.model.as_mut()
    }
}
