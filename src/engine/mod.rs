//! The orchestration engine
//!
//! Phases in order: component builder, distributed coordinator, precision
//! controller, then the epoch loop with its checkpoint policy and the export
//! pipeline. Each phase lives in its own module; [`trainer::Engine`] sequences
//! them.

pub mod builder;
pub mod checkpoint;
pub mod distributed;
pub mod ema;
pub mod export;
pub mod precision;
pub mod stats;
pub mod trainer;

pub use builder::{build_components, effective_iterations, ComponentSet};
pub use checkpoint::{read_manifest, restore, save, BestRecord, CheckpointManifest, SaveRequest};
pub use distributed::{
    resolve_seed, LocalGroup, ProcessGroup, ResolvedRunState, DEFAULT_DISTRIBUTED_SEED,
};
pub use ema::EmaTracker;
pub use export::{
    apply_rep_hooks, serialize_artifact, ExportManifest, ExportModel, OutputActivation,
};
pub use precision::{
    AmpLevel, GradScaler, PrecisionContext, PrecisionController, RuntimeCapabilities,
};
pub use stats::{AverageMeter, RunningStats};
pub use trainer::{Engine, EpochOps, EvalContext, InferenceScope, TrainContext};
