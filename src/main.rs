use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use vistrain::components::baseline::{BaselineFactory, ClassificationOps};
use vistrain::engine::{Engine, LocalGroup, ProcessGroup, RuntimeCapabilities};
use vistrain::{logging, RunConfig, RunMode};

#[derive(Parser)]
#[command(name = "vistrain")]
#[command(about = "Supervised visual-model training, evaluation, and export", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model, with optional in-loop evaluation
    Train {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Evaluate a model on the eval split
    Eval {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Export a trained model as an inference artifact
    Export {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate a configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config } => run(config, RunMode::Train),
        Commands::Eval { config } => run(config, RunMode::Eval),
        Commands::Export { config } => run(config, RunMode::Export),
        Commands::Config { file } => validate_config(file),
    }
}

fn run(config_path: PathBuf, mode: RunMode) -> Result<()> {
    let config = RunConfig::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let group = LocalGroup::from_env();
    logging::init(&config.run_dir(), mode, group.rank() == 0)
        .context("failed to initialize logging")?;

    let factory = BaselineFactory::new();
    let capabilities = RuntimeCapabilities::host();
    let mut engine = Engine::new(config, mode, &factory, &group, &capabilities)
        .context("failed to build the engine")?;

    let mut ops = ClassificationOps::new();
    match mode {
        RunMode::Train => {
            let best = engine.train(&mut ops).context("training failed")?;
            info!(
                metric = best.metric,
                epoch = best.epoch,
                "training finished"
            );
        }
        RunMode::Eval => {
            let metric = engine.eval(&mut ops).context("evaluation failed")?;
            info!(metric, "evaluation finished");
        }
        RunMode::Export => {
            let path = engine.export().context("export failed")?;
            info!(path = %path.display(), "inference artifact written");
        }
        RunMode::Infer => {
            anyhow::bail!("batch inference is not wired into this binary yet");
        }
    }
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    let config = RunConfig::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    println!("Configuration is valid");
    println!("  - Arch: {}", config.arch.name);
    println!("  - Device: {}", config.global.device);
    println!("  - Epochs: {}", config.global.epochs);
    println!("  - Output: {}", config.run_dir().display());
    if let Some(amp) = &config.amp {
        println!("  - AMP: {}", amp.level);
    }
    if let Some(ema) = &config.ema {
        println!("  - EMA decay: {}", ema.decay);
    }
    Ok(())
}
