//! Precision Controller
//!
//! Validates and applies the mixed-precision execution level, manages the
//! loss-scaling policy, and resolves version/level incompatibilities by
//! degrading to full precision with a warning rather than failing. The level
//! is resolved exactly once at setup and never changes mid-run.

use std::collections::HashMap;
use std::fmt;

use candle_core::Tensor;
use tracing::warn;

use crate::components::{Model, ModelOutput, Optimizer, RepLayer};
use crate::config::{RunConfig, RunMode};
use crate::error::{Error, Result};

/// Minimum numeric-runtime capability for low-precision evaluation under O2
const MIN_O2_EVAL_VERSION: (u32, u32) = (0, 9);

/// Mixed-precision optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpLevel {
    /// Selective low-precision for safe operations
    O1,
    /// Model-wide low-precision with a full-precision master copy
    O2,
}

impl AmpLevel {
    /// Parse a requested level, degrading invalid input to O1 with a warning
    pub fn parse_lossy(raw: &str) -> Self {
        match raw {
            "O1" => Self::O1,
            "O2" => Self::O2,
            other => {
                warn!(
                    requested = other,
                    "the mixed-precision level only supports O1 and O2; using O1"
                );
                Self::O1
            }
        }
    }
}

impl fmt::Display for AmpLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::O1 => f.write_str("O1"),
            Self::O2 => f.write_str("O2"),
        }
    }
}

/// Reported capabilities of the host numeric runtime.
///
/// The capability check only ever downgrades behavior; it must not fail.
#[derive(Debug, Clone)]
pub struct RuntimeCapabilities {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Development builds are assumed fully capable
    pub dev: bool,
}

impl RuntimeCapabilities {
    /// Parse a reported version string; unparseable versions are treated as
    /// development builds so the check can never reject a runtime it does not
    /// understand.
    pub fn from_version(raw: &str) -> Self {
        if raw == "0.0.0" || raw.contains("dev") {
            return Self {
                major: 0,
                minor: 0,
                dev: true,
            };
        }
        let mut parts = raw.split('.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        match (major, minor) {
            (Some(major), Some(minor)) => Self {
                major,
                minor,
                dev: false,
            },
            _ => Self {
                major: 0,
                minor: 0,
                dev: true,
            },
        }
    }

    /// Capabilities of the linked tensor runtime
    pub fn host() -> Self {
        // Tracks the candle release this crate pins.
        Self::from_version("0.9.1")
    }

    /// Whether low-precision evaluation under O2 is supported
    pub fn supports_low_precision_eval(&self) -> bool {
        self.dev || (self.major, self.minor) >= MIN_O2_EVAL_VERSION
    }
}

/// Dynamic (or fixed) loss-scaling policy for mixed-precision gradients
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    dynamic: bool,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    stable_steps: usize,
}

impl GradScaler {
    /// Create a scaler with the configured initial scale
    pub fn new(init_scale: f64, dynamic: bool) -> Self {
        Self {
            scale: init_scale,
            dynamic,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            stable_steps: 0,
        }
    }

    /// Current loss scale
    pub fn loss_scale(&self) -> f64 {
        self.scale
    }

    /// Multiplier that undoes the loss scale on gradients
    pub fn inv_scale(&self) -> f64 {
        1.0 / self.scale
    }

    /// Scale a loss tensor before backward
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Advance the scaling policy after one optimizer step.
    ///
    /// Under dynamic scaling, an overflow halves the scale and resets the
    /// stability counter; a long enough stable streak doubles it. Fixed
    /// scaling ignores both.
    pub fn update(&mut self, found_overflow: bool) {
        if !self.dynamic {
            return;
        }
        if found_overflow {
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.stable_steps = 0;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.stable_steps = 0;
            }
        }
    }
}

/// Resolved precision context; exists only when mixed precision is enabled
pub struct PrecisionContext {
    /// Resolved optimization level
    pub level: AmpLevel,
    /// Loss-scaling policy
    pub scaler: GradScaler,
    /// Run evaluation in low precision
    pub amp_eval: bool,
}

/// Controller state: `disabled -> validating -> resolved`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Disabled,
    Validating,
    Resolved,
}

/// Resolves the precision configuration exactly once per run
pub struct PrecisionController {
    state: ControllerState,
}

impl PrecisionController {
    /// A controller in its initial state
    pub fn new() -> Self {
        Self {
            state: ControllerState::Disabled,
        }
    }

    /// Resolve the AMP section into a [`PrecisionContext`].
    ///
    /// Returns `None` (full precision) when no AMP section is configured.
    /// All degradations warn and continue; nothing in here is fatal.
    pub fn resolve(
        &mut self,
        config: &RunConfig,
        mode: RunMode,
        capabilities: &RuntimeCapabilities,
    ) -> Result<Option<PrecisionContext>> {
        let Some(amp) = &config.amp else {
            self.state = ControllerState::Disabled;
            return Ok(None);
        };
        self.state = ControllerState::Validating;

        let level = AmpLevel::parse_lossy(&amp.level);
        let scaler = GradScaler::new(amp.scale_loss, amp.use_dynamic_loss_scaling);

        let mut amp_eval = amp.use_fp16_test;
        if mode == RunMode::Train
            && config.global.eval_during_train
            && level == AmpLevel::O2
            && !amp_eval
        {
            warn!("only low-precision evaluation is supported when training with AMP O2; forcing it on");
            amp_eval = true;
        }

        if level == AmpLevel::O2 && amp_eval && !capabilities.supports_low_precision_eval() {
            warn!(
                major = capabilities.major,
                minor = capabilities.minor,
                "the installed numeric runtime does not support low-precision evaluation \
                 under AMP O2; reverting to full-precision evaluation"
            );
            amp_eval = false;
        }

        self.state = ControllerState::Resolved;
        Ok(Some(PrecisionContext {
            level,
            scaler,
            amp_eval,
        }))
    }

    /// Whether the controller has finished resolving
    pub fn is_resolved(&self) -> bool {
        self.state == ControllerState::Resolved
    }
}

impl Default for PrecisionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the precision decoration to model and optimizer jointly.
///
/// Decorating only one of the two is invalid, so the signature demands both;
/// an absent model or optimizer is a fatal precondition violation.
pub fn decorate(
    context: &PrecisionContext,
    model_slot: &mut Option<Box<dyn Model>>,
    optimizer_slot: &mut Option<Box<dyn Optimizer>>,
) -> Result<()> {
    if optimizer_slot.is_none() {
        return Err(Error::precondition(
            "build the optimizer before enabling mixed precision",
        ));
    }
    let model = model_slot
        .take()
        .ok_or_else(|| Error::precondition("build the model before enabling mixed precision"))?;
    *model_slot = Some(Box::new(PrecisionModel {
        inner: model,
        level: context.level,
    }));
    Ok(())
}

/// Transparent precision decoration around a model.
///
/// Numeric lowering is the tensor runtime's concern at this seam; the wrapper
/// records the resolved level and keeps composition transparent.
pub struct PrecisionModel {
    inner: Box<dyn Model>,
    level: AmpLevel,
}

impl PrecisionModel {
    /// The resolved level this model runs under
    pub fn level(&self) -> AmpLevel {
        self.level
    }
}

impl Model for PrecisionModel {
    fn forward(&self, input: &Tensor) -> Result<ModelOutput> {
        self.inner.forward(input)
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        self.inner.state()
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        self.inner.load_state(state)
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.inner.is_training()
    }

    fn rep_sublayers(&mut self) -> Vec<&mut dyn RepLayer> {
        self.inner.rep_sublayers()
    }

    fn replace_head_with_identity(&mut self) -> bool {
        self.inner.replace_head_with_identity()
    }

    fn is_quantized(&self) -> bool {
        self.inner.is_quantized()
    }
}
