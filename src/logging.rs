//! Logging initialization and scalar time-series output
//!
//! The run log goes to stderr on every rank and, on the coordinating rank
//! only, to `{output_dir}/{arch_name}/{mode}.log`. Scalar time-series records
//! (epoch accuracy and friends) are appended as JSON lines for external
//! visualization, again only by the coordinating rank.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::RunMode;
use crate::error::Result;

/// Initialize the global tracing subscriber for a run.
///
/// Safe to call more than once; later calls keep the existing subscriber
/// (this is what allows tests to share a process).
pub fn init(run_dir: &Path, mode: RunMode, coordinator: bool) -> Result<()> {
    let file_layer = if coordinator {
        std::fs::create_dir_all(run_dir)?;
        let log_file = File::create(run_dir.join(format!("{mode}.log")))?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Arc::new(log_file)),
        )
    } else {
        None
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();

    Ok(())
}

/// Appends named scalar records to `scalars.jsonl` under the run directory.
///
/// One record per line: `{"name", "step", "value", "time"}`.
#[derive(Debug)]
pub struct ScalarWriter {
    path: PathBuf,
    file: File,
}

impl ScalarWriter {
    /// Open (or create) the scalar series for a run directory
    pub fn open(run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join("scalars.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Append one scalar record
    pub fn record(&mut self, name: &str, step: usize, value: f64) -> Result<()> {
        let row = serde_json::json!({
            "name": name,
            "step": step,
            "value": value,
            "time": Utc::now().to_rfc3339(),
        });
        writeln!(self.file, "{row}")?;
        Ok(())
    }

    /// Path of the underlying series file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
