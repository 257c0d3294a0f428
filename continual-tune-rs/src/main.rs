//! CLI entry point for continual-tune.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use continual_tune_rs::engine::EngineState;
use continual_tune_rs::ingest;
use continual_tune_rs::queue::{ExampleQueue, SharedQueue};
use continual_tune_rs::{ContinualConfig, ContinualError, Result, TrainingEngine, TrainingScheduler};

#[derive(Parser)]
#[command(name = "continual-tune")]
#[command(about = "Background continual fine-tuning with LoRA and episodic fast learning")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Import examples and train until the queue drains
    Train {
        /// Path to configuration file
        config: String,
        /// JSONL datasets or text documents to import
        #[arg(long = "data", required = true, num_args = 1..)]
        data: Vec<PathBuf>,
        /// Where to save the engine state (default: <output_dir>/state.json)
        #[arg(long)]
        state: Option<PathBuf>,
        /// Resume from an existing state file
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Maximum characters per document chunk
        #[arg(long, default_value_t = 1000)]
        chunk_chars: usize,
        /// Upper bound on scheduler ticks
        #[arg(long, default_value_t = 10_000)]
        max_ticks: u64,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Print a summary of a saved engine state
    Inspect {
        /// Path to a state file
        state: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (tiny, small)
        #[arg(long, default_value = "small")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = ContinualConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Mode: {:?}", config.mode);
            println!("  Backend: {:?}", config.backend);
            println!(
                "  Model: {} layers, hidden {}, {} heads",
                config.model.num_layers, config.model.hidden_size, config.model.num_heads
            );
        }
        Commands::Train {
            config,
            data,
            state,
            resume,
            chunk_chars,
            max_ticks,
            no_progress,
        } => {
            tracing::info!("Starting continual training with config: {}", config);
            let config = ContinualConfig::from_file(&config)?;
            let state_path =
                state.unwrap_or_else(|| Path::new(&config.output_dir).join("state.json"));
            train(
                &config,
                &data,
                &state_path,
                resume.as_deref(),
                chunk_chars,
                max_ticks,
                !no_progress,
            )?;
        }
        Commands::Inspect { state } => {
            let state = EngineState::load(&state)?;
            inspect(&state);
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = ContinualConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn train(
    config: &ContinualConfig,
    data: &[PathBuf],
    state_path: &Path,
    resume: Option<&Path>,
    chunk_chars: usize,
    max_ticks: u64,
    progress: bool,
) -> Result<()> {
    let mut engine = TrainingEngine::with_reference_model(config.clone())?;
    if let Some(path) = resume {
        engine.load_state(path)?;
        println!("✓ Resumed from {} at step {}", path.display(), engine.step());
    }

    let imported = ingest::import_paths(data, chunk_chars);
    for outcome in imported.outcomes.iter().filter(|o| !o.success) {
        eprintln!(
            "✗ {}: {}",
            outcome.item,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    let (ok, failed) = (imported.succeeded(), imported.failed());
    let queue = SharedQueue::new(ExampleQueue::new(&config.queue));
    let queued = queue.add_batch(imported.examples);
    println!("✓ Imported {queued} examples ({ok} items ok, {failed} failed)");
    if queued == 0 {
        return Err(ContinualError::Import("no examples to train on".into()));
    }

    let mut scheduler = TrainingScheduler::new(config, engine, queue);
    let summary = scheduler.run_until_drained(max_ticks, progress)?;
    if !summary.drained {
        eprintln!(
            "! Stopped after {max_ticks} ticks with {} examples queued",
            scheduler.queue().len()
        );
    }

    let engine = scheduler.engine();
    let engine = engine.lock();
    engine.save_state(state_path)?;
    let stats = engine.stats();
    println!(
        "✓ Trained {} bursts on {} examples",
        summary.bursts, summary.examples
    );
    if let Some(loss) = summary.last_loss {
        println!("  Last loss: {loss:.4}");
    }
    println!("  Mode: {:?}", stats.mode);
    println!("  Fast learning ratio: {:.2}", stats.fast_learning_ratio);
    println!("✓ State saved to: {}", state_path.display());
    Ok(())
}

fn inspect(state: &EngineState) {
    let parameters: usize = state.weights.values().map(Vec::len).sum();
    println!("Engine state v{}", state.version);
    println!("  Mode: {:?}", state.mode);
    println!("  Step: {} ({} optimizer updates)", state.step, state.optimizer_steps);
    println!("  Metrics recorded: {}", state.metrics.len());
    if let Some(last) = state.metrics.last() {
        println!("  Last loss: {:.4}", last.loss);
    }
    println!("  Fast learning ratio: {:.2}", state.counters.ratio());
    println!(
        "  Base weights: {} tensors, {parameters} parameters",
        state.weights.len()
    );
    if let Some(lora) = &state.lora {
        println!(
            "  LoRA: {} layers, r={}, alpha={}",
            lora.layers.len(),
            lora.rank,
            lora.alpha
        );
    }
    if let Some(fast) = &state.fast_learner {
        println!(
            "  Fast learner: {} memories, {} connections",
            fast.memories.len(),
            fast.connections.len()
        );
    }
}
