//! vistrain - Supervised visual-model training, evaluation, and export
//!
//! This crate provides the orchestration engine for supervised training
//! workflows: it builds components from a declarative YAML configuration,
//! runs the epoch loop with in-loop evaluation, EMA tracking, and checkpoint
//! management, and exports trained models as inference artifacts.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;

// Re-exports
pub use components::{ComponentFactory, DataLoader, Loss, Metric, Model, Optimizer};
pub use config::{RunConfig, RunMode};
pub use engine::{BestRecord, Engine, EpochOps, LocalGroup, RuntimeCapabilities};
pub use error::{Error, Result};
