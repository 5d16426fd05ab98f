//! Report, sampling and training pipelines for the diffpolicy CLI.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use diffpolicy::model::bridge::tensor_to_vec;
use diffpolicy::model::{PointBackbone, PointMlpBackbone};
use diffpolicy::training::data::SyntheticSampler;
use diffpolicy::training::trainer::{resume_from_checkpoint, train};
use diffpolicy::{DiffusionPolicy, InferenceMode, PolicyConfig, ACTION_WIDTH, DATASET_ACTION_WIDTH};

use crate::config::{build_training_config, load_policy_toml, TrainCli};

type CliBackend = NdArray<f32>;
type CliAutodiffBackend = Autodiff<NdArray<f32>>;

/// Arguments for the `report` subcommand.
#[derive(Debug)]
pub struct ReportArgs {
    pub config: PathBuf,
    pub json: bool,
}

/// Arguments for the `sample` subcommand.
#[derive(Debug)]
pub struct SampleArgs {
    pub config: PathBuf,
    /// Checkpoint directory to load weights from.
    pub checkpoint: Option<PathBuf>,
    pub num_batches: usize,
    pub batch_size: usize,
    /// Emit the ground-truth conditioned rotation too.
    pub dataset: bool,
    pub seed: u64,
    /// JSONL destination; stdout when `None`.
    pub output: Option<PathBuf>,
}

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    pub config: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub steps: Option<usize>,
    pub lr: Option<f64>,
    pub batch_size: Option<usize>,
    /// Step checkpoint under the output directory to resume from.
    pub resume_from: Option<usize>,
    pub seed: Option<u64>,
}

/// Parameter counts plus the settings that shape them.
#[derive(Debug, Serialize)]
struct Report {
    rot_pred_type: String,
    context_channels: usize,
    hidden_size: usize,
    total_timesteps: usize,
    inference_steps: usize,
    params: diffpolicy::ParamReport,
}

/// One predicted action, as written to the JSONL output.
#[derive(Debug, Serialize, PartialEq)]
pub struct ActionRecord {
    pub sample: usize,
    pub position: [f32; 3],
    /// Unit quaternion, xyzw.
    pub quaternion: [f32; 4],
    pub openness_logit: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt_conditioned: Option<ConditionedRotation>,
}

/// Rotation and openness predicted from the ground-truth position.
#[derive(Debug, Serialize, PartialEq)]
pub struct ConditionedRotation {
    pub quaternion: [f32; 4],
    pub openness_logit: f32,
}

/// Split flat action rows into records, numbering samples from `first`.
pub fn action_records(flat: &[f32], width: usize, first: usize) -> anyhow::Result<Vec<ActionRecord>> {
    if width != ACTION_WIDTH && width != DATASET_ACTION_WIDTH {
        anyhow::bail!("unexpected action width {width}");
    }
    if flat.len() % width != 0 {
        anyhow::bail!("{} values do not split into rows of {width}", flat.len());
    }
    let quat = |r: &[f32]| [r[0], r[1], r[2], r[3]];
    Ok(flat
        .chunks_exact(width)
        .enumerate()
        .map(|(i, row)| ActionRecord {
            sample: first + i,
            position: [row[0], row[1], row[2]],
            quaternion: quat(&row[3..7]),
            openness_logit: row[7],
            gt_conditioned: (width == DATASET_ACTION_WIDTH).then(|| ConditionedRotation {
                quaternion: quat(&row[8..12]),
                openness_logit: row[12],
            }),
        })
        .collect())
}

fn build_report<B: Backend, N: PointBackbone<B>>(policy: &DiffusionPolicy<B, N>) -> Report {
    let config = policy.config();
    Report {
        rot_pred_type: config.action.rot_pred_type.to_string(),
        context_channels: config.action.context_channels,
        hidden_size: config.backbone.hidden_size,
        total_timesteps: config.diffusion.total_timesteps,
        inference_steps: config.diffusion.num_inference_steps(),
        params: policy.param_report(),
    }
}

/// Validate the config, build the policy and print its parameter counts.
pub fn run_report(args: ReportArgs) -> anyhow::Result<()> {
    let toml = load_policy_toml(&args.config)?;
    let device = Default::default();
    let policy = DiffusionPolicy::<CliBackend, _, _>::reference(toml.policy, &device)?;
    let report = build_report(&policy);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("--- Policy Report ---");
        println!("Rotation: {}", report.rot_pred_type);
        println!("Context channels: {}", report.context_channels);
        println!("Hidden size: {}", report.hidden_size);
        println!(
            "Timesteps: {} train / {} inference",
            report.total_timesteps, report.inference_steps
        );
        println!("Backbone params: {}", report.params.backbone);
        println!("Context params: {}", report.params.context);
        println!("Action head params: {}", report.params.action_head);
        println!("Total params: {}", report.params.total);
    }
    Ok(())
}

fn load_policy(
    config: PolicyConfig,
    checkpoint: Option<&Path>,
    device: &<CliBackend as Backend>::Device,
) -> anyhow::Result<DiffusionPolicy<CliBackend, PointMlpBackbone<CliBackend>>> {
    match checkpoint {
        Some(dir) => {
            tracing::info!(path = %dir.display(), "Loading policy checkpoint");
            resume_from_checkpoint::<CliBackend>(dir, &config, device)
        }
        None => {
            tracing::warn!("No checkpoint given, sampling from randomly initialized weights");
            Ok(DiffusionPolicy::reference(config, device)?)
        }
    }
}

/// Run the full denoising loop on synthetic batches and write one JSON line
/// per predicted action.
pub fn run_sample(args: SampleArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let toml = load_policy_toml(&args.config)?;
    let device = Default::default();
    CliBackend::seed(args.seed);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let sampler = SyntheticSampler::new(&toml.policy)?;
    let mut policy = load_policy(toml.policy, args.checkpoint.as_deref(), &device)?;
    let (mode, width) = if args.dataset {
        (InferenceMode::DatasetInspection, DATASET_ACTION_WIDTH)
    } else {
        (InferenceMode::Deploy, ACTION_WIDTH)
    };

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::io::BufWriter::new(std::fs::File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };

    let pb = ProgressBar::new(args.num_batches as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("valid progress bar template")
            .progress_chars("=> "),
    );

    let mut written = 0usize;
    for batch_idx in 0..args.num_batches {
        pb.set_message(format!("batch {batch_idx}"));
        let batch = sampler.sample_batch::<CliBackend>(args.batch_size, &mut rng, &device)?;
        let actions = policy.forward_n_steps(&batch, mode)?;
        let records = action_records(&tensor_to_vec(actions)?, width, written)?;
        for record in &records {
            serde_json::to_writer(&mut out, record)?;
            writeln!(out)?;
        }
        written += records.len();
        pb.inc(1);
    }
    out.flush()?;
    pb.finish_with_message("done");

    tracing::info!(
        actions = written,
        elapsed_secs = format!("{:.1}", start.elapsed().as_secs_f64()),
        "Sampling finished"
    );
    Ok(())
}

/// Train the reference policy on synthetic batches.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let toml = load_policy_toml(&args.config)?;
    let cli = TrainCli {
        checkpoint_dir: args.output_dir.map(|p| p.to_string_lossy().into_owned()),
        total_steps: args.steps,
        lr: args.lr,
        batch_size: args.batch_size,
        seed: args.seed,
    };
    let train_config = build_training_config(&toml.train, &cli);
    let device = Default::default();

    let sampler = SyntheticSampler::new(&toml.policy)?;
    let policy = match args.resume_from {
        Some(step) => {
            let dir = PathBuf::from(&train_config.checkpoint_dir).join(format!("step_{step}"));
            tracing::info!(path = %dir.display(), "Resuming policy weights");
            resume_from_checkpoint::<CliAutodiffBackend>(&dir, &toml.policy, &device)?
        }
        None => DiffusionPolicy::<CliAutodiffBackend, _, _>::reference(toml.policy, &device)?,
    };
    std::fs::create_dir_all(&train_config.checkpoint_dir)?;
    std::fs::write(
        Path::new(&train_config.checkpoint_dir).join("policy.json"),
        serde_json::to_string_pretty(policy.config())?,
    )?;

    let trained = train(&train_config, policy, &sampler, &device, args.resume_from)?;
    let report = build_report(&trained);

    println!("\n--- Training Summary ---");
    println!("Steps: {}", train_config.total_steps);
    println!("Params: {}", report.params);
    println!("Checkpoints: {}", train_config.checkpoint_dir);
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
