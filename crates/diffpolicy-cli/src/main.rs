mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{ReportArgs, SampleArgs, TrainArgs};

/// diffpolicy: diffusion point-cloud policy for end-effector action prediction.
#[derive(Parser)]
#[command(name = "diffpolicy", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for inspecting, sampling from, and training a policy.
#[derive(Subcommand)]
enum Command {
    /// Validate a config and print the per-component parameter counts.
    Report {
        /// Path to the policy config TOML file.
        #[arg(long, default_value = "configs/policy.toml")]
        config: PathBuf,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
    /// Run the denoising loop on synthetic observations and write actions as JSONL.
    Sample {
        /// Path to the policy config TOML file.
        #[arg(long, default_value = "configs/policy.toml")]
        config: PathBuf,
        /// Checkpoint directory with `net` and `backbone` weights. Random init when unset.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Number of synthetic batches to run.
        #[arg(long, default_value_t = 1)]
        num_batches: usize,
        /// Observations per batch.
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        /// Also predict rotation and openness from the ground-truth position.
        #[arg(long)]
        dataset: bool,
        /// Seed for synthetic data and initial noise.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Output JSONL file. Prints to stdout when unset.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Train the policy on synthetic observations.
    Train {
        /// Path to the policy config TOML file (with an optional `[train]` table).
        #[arg(long, default_value = "configs/policy.toml")]
        config: PathBuf,
        /// Override the checkpoint directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Override the number of training steps.
        #[arg(long)]
        steps: Option<usize>,
        /// Override the base learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Override observations per step.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Resume from `{output_dir}/step_{N}`.
        #[arg(long)]
        resume_from: Option<usize>,
        /// Override the training seed.
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Report { config, json } => pipeline::run_report(ReportArgs { config, json }),
        Command::Sample {
            config,
            checkpoint,
            num_batches,
            batch_size,
            dataset,
            seed,
            output,
        } => pipeline::run_sample(SampleArgs {
            config,
            checkpoint,
            num_batches,
            batch_size,
            dataset,
            seed,
            output,
        }),
        Command::Train {
            config,
            output_dir,
            steps,
            lr,
            batch_size,
            resume_from,
            seed,
        } => pipeline::run_train(TrainArgs {
            config,
            output_dir,
            steps,
            lr,
            batch_size,
            resume_from,
            seed,
        }),
    }
}
