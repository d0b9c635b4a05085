//! Distributed Coordinator
//!
//! Detects the process topology, derives a reproducible per-rank seed, and
//! wraps the model (and the loss, when it owns trainable parameters) for
//! gradient synchronization. Gradient exchange itself is an implicit barrier
//! inside the wrappers; the orchestrator only sequences the setup.

use std::collections::HashMap;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::components::{Loss, Model, ModelOutput, RepLayer};
use crate::config::RunConfig;
use crate::engine::builder::ComponentSet;
use crate::error::{Error, Result};

/// Default base seed when distributed training is requested without one.
///
/// An undefined seed is unsafe for reproducible multi-rank training, so the
/// coordinator falls back to this and warns instead of failing.
pub const DEFAULT_DISTRIBUTED_SEED: u64 = 42;

/// Process-group abstraction: topology plus a synchronization barrier
pub trait ProcessGroup {
    /// This process's rank, zero-based
    fn rank(&self) -> usize;

    /// Total number of cooperating processes
    fn world_size(&self) -> usize;

    /// Block until every rank reaches this point
    fn barrier(&self) -> Result<()>;
}

/// Process group derived from the launcher environment.
///
/// Reads `RANK` and `WORLD_SIZE`; absent variables mean a single-process
/// group. Real multi-process transports implement [`ProcessGroup`] as an
/// external collaborator.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
}

impl LocalGroup {
    /// Read the topology from the environment
    pub fn from_env() -> Self {
        let rank = std::env::var("RANK")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let world_size = std::env::var("WORLD_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Self { rank, world_size }
    }

    /// A fixed single-process group
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Runtime facts resolved once during setup.
///
/// The raw configuration stays immutable; downstream phases (checkpoint
/// policy, log output) read the resolved state instead.
#[derive(Debug, Clone)]
pub struct ResolvedRunState {
    /// Whether this run is effectively distributed (world size > 1)
    pub distributed: bool,
    /// World size recomputed after setup
    pub world_size: usize,
    /// This process's rank
    pub rank: usize,
    /// Effective per-rank seed
    pub seed: u64,
}

impl ResolvedRunState {
    /// Whether this process owns the output directory (single-writer discipline)
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// A generator seeded with the per-rank seed
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }
}

/// Derive the effective per-rank seed.
///
/// Distributed runs require a base seed; a missing one falls back to
/// [`DEFAULT_DISTRIBUTED_SEED`] with a warning. Each rank offsets the base by
/// its rank so data order differs across ranks but stays reproducible.
pub fn resolve_seed(configured: Option<u64>, distributed: bool, rank: usize) -> u64 {
    let base = match configured {
        Some(seed) => seed,
        None if distributed => {
            warn!(
                "the random seed cannot be unset in a distributed environment; \
                 falling back to {DEFAULT_DISTRIBUTED_SEED}"
            );
            DEFAULT_DISTRIBUTED_SEED
        }
        None => 0,
    };
    base + rank as u64
}

/// Configure the distributed topology for an already-built component set.
///
/// Precondition: the model (and, in train mode, the train loss) must exist;
/// violating this is fatal. Side effect: the resolved topology, including the
/// recomputed `distributed` flag, is returned for downstream consumers.
pub fn setup(
    config: &RunConfig,
    components: &mut ComponentSet,
    group: &dyn ProcessGroup,
) -> Result<ResolvedRunState> {
    let world_size = group.world_size();
    let rank = group.rank();

    if config.global.distributed {
        let model = components
            .model
            .take()
            .ok_or_else(|| Error::precondition("build the model before distributed wrapping"))?;
        components.model = Some(Box::new(SyncModel::new(model, world_size)));

        if components.train_loss.is_some() {
            let loss = components.train_loss.take().ok_or_else(|| {
                Error::precondition("build the train loss before distributed wrapping")
            })?;
            let loss = if loss.trainable_parameters().is_empty() {
                loss
            } else {
                Box::new(SyncLoss::new(loss, world_size))
            };
            components.train_loss = Some(loss);
        } else {
            return Err(Error::precondition(
                "build the train loss before distributed wrapping",
            ));
        }

        group.barrier()?;
        info!(rank, world_size, "distributed environment initialized");
    }

    let seed = resolve_seed(config.global.seed, config.global.distributed, rank);
    if config.global.seed.is_some() || config.global.distributed {
        info!(seed, rank, "per-rank random seed resolved");
    }

    Ok(ResolvedRunState {
        distributed: world_size != 1,
        world_size,
        rank,
        seed,
    })
}

/// Transparent gradient-synchronization wrapper around a model.
///
/// Identity of the wrapped model is untouched; forward and state calls
/// delegate, and gradient exchange is the wrapper's (i.e. the transport
/// collaborator's) concern.
pub struct SyncModel {
    inner: Box<dyn Model>,
    world_size: usize,
}

impl SyncModel {
    /// Wrap `inner` for synchronization across `world_size` ranks
    pub fn new(inner: Box<dyn Model>, world_size: usize) -> Self {
        Self { inner, world_size }
    }

    /// Number of ranks gradients are averaged over
    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

impl Model for SyncModel {
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

/// Synchronization wrapper for losses that own trainable parameters
pub struct SyncLoss {
    inner: Box<dyn Loss>,
    #[allow(dead_code)]
    world_size: usize,
}

impl SyncLoss {
    /// Wrap `inner` for synchronization across `world_size` ranks
    pub fn new(inner: Box<dyn Loss>, world_size: usize) -> Self {
        Self { inner, world_size }
    }
}

impl Loss for SyncLoss {
    fn compute(
        &self,
        output: &ModelOutput,
        targets: &Tensor,
    ) -> Result<(Tensor, HashMap<String, f64>)> {
        self.inner.compute(output, targets)
    }

    fn trainable_parameters(&self) -> HashMap<String, Tensor> {
        self.inner.trainable_parameters()
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        self.inner.load_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_offsets_by_rank() {
        assert_eq!(resolve_seed(Some(100), true, 0), 100);
        assert_eq!(resolve_seed(Some(100), true, 3), 103);
        assert_eq!(resolve_seed(Some(7), false, 0), 7);
    }

    #[test]
    fn missing_seed_falls_back_in_distributed_mode() {
        assert_eq!(resolve_seed(None, true, 0), DEFAULT_DISTRIBUTED_SEED);
        assert_eq!(resolve_seed(None, true, 2), DEFAULT_DISTRIBUTED_SEED + 2);
        assert_eq!(resolve_seed(None, false, 0), 0);
    }

    #[test]
    fn solo_group_is_rank_zero() {
        let group = LocalGroup::solo();
        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        assert!(group.barrier().is_ok());
    }

    #[test]
    fn resolved_state_coordinator_flag() {
        let state = ResolvedRunState {
            distributed: true,
            world_size: 4,
            rank: 0,
            seed: 42,
        };
        assert!(state.is_coordinator());
        let state = ResolvedRunState { rank: 1, ..state };
        assert!(!state.is_coordinator());
    }
}
