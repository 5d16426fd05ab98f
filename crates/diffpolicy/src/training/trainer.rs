//! Diffusion policy training loop.
//!
//! Two AdamW optimizers (one for the policy net, one for the backbone) share
//! a single backward pass per step. Their rates follow one warmup + cosine
//! curve, with the backbone's scaled down by `backbone_lr_scale`.

use std::path::Path;
use std::time::Instant;

use anyhow::anyhow;
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use rand::SeedableRng;

use crate::config::PolicyConfig;
use crate::model::{PointBackbone, PointMlpBackbone};
use crate::policy::{DiffusionPolicy, PolicyNet};
use crate::scheduler::{DdpmScheduler, NoiseScheduler};
use crate::training::data::SyntheticSampler;
use crate::training::loss::LossValues;

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub struct CheckpointMeta {
    pub step: usize,
    pub trained_steps: u64,
    pub skipped_steps: u64,
}

/// Configuration for policy training.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Peak learning rate of the policy net optimizer.
    #[config(default = 1e-4)]
    pub lr: f64,
    /// Rate the cosine decay ends at.
    #[config(default = 0.0)]
    pub min_lr: f64,
    /// Backbone rate as a fraction of the policy net rate.
    #[config(default = 1.0)]
    pub backbone_lr_scale: f64,
    #[config(default = 0.01)]
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping.
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
    #[config(default = 1_000)]
    pub total_steps: usize,
    /// Number of linear warmup steps.
    #[config(default = 100)]
    pub warmup_steps: usize,
    /// Observations per step (before mini-batch replication).
    #[config(default = 8)]
    pub batch_size: usize,
    /// Steps between metric logging.
    #[config(default = 50)]
    pub log_interval: usize,
    /// Steps between checkpoint saves.
    #[config(default = 500)]
    pub checkpoint_interval: usize,
    #[config(default = "String::from(\"checkpoints/diffpolicy\")")]
    pub checkpoint_dir: String,
    /// Seed for timestep sampling and synthetic data. Entropy when unset.
    pub seed: Option<u64>,
}

/// Learning rates for one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRates {
    pub net: f64,
    pub backbone: f64,
}

impl TrainingConfig {
    /// Rates at `step`: a linear ramp over `warmup_steps` up to `lr`, then a
    /// half cosine down to `min_lr` at `total_steps`. The backbone follows
    /// the same curve scaled by `backbone_lr_scale`.
    pub fn rates_at(&self, step: usize) -> StepRates {
        let net = if step < self.warmup_steps {
            self.lr * (step + 1) as f64 / self.warmup_steps as f64
        } else {
            let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
            let t = ((step - self.warmup_steps) as f64 / span).min(1.0);
            let cosine = 0.5 * (1.0 + (std::f64::consts::PI * t).cos());
            self.min_lr + (self.lr - self.min_lr) * cosine
        };
        StepRates {
            net,
            backbone: net * self.backbone_lr_scale,
        }
    }
}

/// Running average of loss terms over a logging interval.
#[derive(Default)]
struct RunningAvg {
    sum: LossValues,
    count: usize,
}

impl RunningAvg {
    fn update(&mut self, v: &LossValues) {
        self.sum.pos += v.pos;
        self.sum.rot += v.rot;
        self.sum.open += v.open;
        self.sum.total += v.total;
        self.count += 1;
    }

    fn avg(&self) -> Option<LossValues> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(LossValues {
            pos: self.sum.pos / n,
            rot: self.sum.rot / n,
            open: self.sum.open / n,
            total: self.sum.total / n,
        })
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Save net, backbone, both optimizer states and metadata into `dir`.
fn save_checkpoint<B, N, ON, OB>(
    dir: &str,
    net: &PolicyNet<B>,
    backbone: &N,
    net_optim: &ON,
    backbone_optim: &OB,
    meta: &CheckpointMeta,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    N: AutodiffModule<B>,
    ON: Optimizer<PolicyNet<B>, B>,
    OB: Optimizer<N, B>,
{
    std::fs::create_dir_all(dir)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

    net.clone()
        .save_file(format!("{dir}/net"), &recorder)
        .map_err(|e| anyhow!("Failed to save policy net to {dir}: {e}"))?;
    backbone
        .clone()
        .save_file(format!("{dir}/backbone"), &recorder)
        .map_err(|e| anyhow!("Failed to save backbone to {dir}: {e}"))?;
    recorder
        .record(net_optim.to_record(), format!("{dir}/net_optimizer").into())
        .map_err(|e| anyhow!("Failed to save net optimizer to {dir}: {e}"))?;
    recorder
        .record(backbone_optim.to_record(), format!("{dir}/backbone_optimizer").into())
        .map_err(|e| anyhow!("Failed to save backbone optimizer to {dir}: {e}"))?;

    serde_json::to_writer(std::fs::File::create(format!("{dir}/meta.json"))?, meta)?;
    Ok(())
}

/// Run the training loop.
///
/// Samples `batch_size` synthetic observations per step, computes the policy
/// losses and applies one optimizer step to the net and one to the
/// backbone. Steps whose loss is not finite are logged and skipped.
///
/// # Arguments
/// - `resume_step`: if `Some(step)`, load optimizer state and metadata from
///   `{checkpoint_dir}/step_{step}/` and continue from that step. Weights are
///   expected to be loaded into `policy` already (see
///   [`resume_from_checkpoint`]).
pub fn train<B, N, S>(
    config: &TrainingConfig,
    mut policy: DiffusionPolicy<B, N, S>,
    sampler: &SyntheticSampler,
    device: &B::Device,
    resume_step: Option<usize>,
) -> anyhow::Result<DiffusionPolicy<B, N, S>>
where
    B: AutodiffBackend,
    N: PointBackbone<B> + AutodiffModule<B>,
    S: NoiseScheduler,
{
    std::fs::create_dir_all(&config.checkpoint_dir)?;

    let optim_config = AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.max_grad_norm as f32)));
    let mut net_optim = optim_config.init::<B, PolicyNet<B>>();
    let mut backbone_optim = optim_config.init::<B, N>();

    let mut rng = match config.seed {
        Some(seed) => {
            B::seed(seed);
            rand::rngs::StdRng::seed_from_u64(seed)
        }
        None => rand::rngs::StdRng::from_entropy(),
    };
    let mut running_avg = RunningAvg::default();
    let train_start = Instant::now();
    let mut trained_steps: u64 = 0;
    let mut skipped_steps: u64 = 0;
    let start_step: usize;

    if let Some(step) = resume_step {
        let step_dir = format!("{}/step_{step}", config.checkpoint_dir);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

        let record = recorder
            .load(format!("{step_dir}/net_optimizer").into(), device)
            .map_err(|e| anyhow!("Failed to load net optimizer from {step_dir}: {e}"))?;
        net_optim = net_optim.load_record(record);
        let record = recorder
            .load(format!("{step_dir}/backbone_optimizer").into(), device)
            .map_err(|e| anyhow!("Failed to load backbone optimizer from {step_dir}: {e}"))?;
        backbone_optim = backbone_optim.load_record(record);
        tracing::info!(step, "Restored optimizer state");

        let meta_path = format!("{step_dir}/meta.json");
        let meta: CheckpointMeta = serde_json::from_reader(
            std::fs::File::open(&meta_path).map_err(|e| anyhow!("Failed to open {meta_path}: {e}"))?,
        )
        .map_err(|e| anyhow!("Failed to parse {meta_path}: {e}"))?;
        trained_steps = meta.trained_steps;
        skipped_steps = meta.skipped_steps;
        start_step = step;

        tracing::info!(start_step, trained_steps, skipped_steps, "Resumed training from checkpoint");
    } else {
        start_step = 0;
    }

    tracing::info!(
        total_steps = config.total_steps,
        batch_size = config.batch_size,
        mini_batches = policy.config().mini_batches,
        rot_pred_type = %policy.codec().kind(),
        "Starting training"
    );

    for step in start_step..config.total_steps {
        let rates = config.rates_at(step);

        let batch = sampler.sample_batch::<B>(config.batch_size, &mut rng, device)?;
        let (_, losses) = policy.forward_train(&batch, &mut rng)?;
        let values = losses.values();

        if !values.is_finite() {
            skipped_steps += 1;
            tracing::warn!(step, ?values, "Non-finite loss, skipping optimizer step");
            continue;
        }
        trained_steps += 1;
        running_avg.update(&values);

        let mut grads = losses.total.backward();
        let net_grads = GradientsParams::from_module(&mut grads, policy.net());
        let backbone_grads = GradientsParams::from_module(&mut grads, policy.backbone());
        policy = policy.map_modules(|net, backbone| {
            (
                net_optim.step(rates.net, net, net_grads),
                backbone_optim.step(rates.backbone, backbone, backbone_grads),
            )
        });

        if config.log_interval > 0 && step % config.log_interval == 0 {
            if let Some(avg) = running_avg.avg() {
                let elapsed = train_start.elapsed().as_secs_f64();
                let done = (step + 1 - start_step) as f64;
                let remaining = elapsed * (config.total_steps - step - 1) as f64 / done;
                let eta = if remaining < 60.0 {
                    format!("{:.0}s", remaining)
                } else if remaining < 3600.0 {
                    format!("{:.0}m", remaining / 60.0)
                } else {
                    format!("{:.1}h", remaining / 3600.0)
                };
                let lr_str = format!("{:.2e}", rates.net);
                let backbone_lr_str = format!("{:.2e}", rates.backbone);
                tracing::info!(
                    step,
                    lr = %lr_str,
                    backbone_lr = %backbone_lr_str,
                    eta,
                    "avg({}) total={:.4} pos={:.4} rot={:.4} open={:.4}",
                    running_avg.count,
                    avg.total,
                    avg.pos,
                    avg.rot,
                    avg.open
                );
            }
            running_avg.reset();
        }

        if config.checkpoint_interval > 0 && step > 0 && step % config.checkpoint_interval == 0 {
            let step_dir = format!("{}/step_{step}", config.checkpoint_dir);
            save_checkpoint(
                &step_dir,
                policy.net(),
                policy.backbone(),
                &net_optim,
                &backbone_optim,
                &CheckpointMeta { step, trained_steps, skipped_steps },
            )?;
            tracing::info!(step, "Checkpoint saved (net + backbone + optimizers + meta)");
        }
    }

    let total_time = train_start.elapsed();
    tracing::info!(
        trained_steps,
        skipped_steps,
        total_steps = config.total_steps,
        elapsed_secs = format!("{:.1}", total_time.as_secs_f64()),
        "Training loop finished"
    );

    let final_dir = format!("{}/final", config.checkpoint_dir);
    save_checkpoint(
        &final_dir,
        policy.net(),
        policy.backbone(),
        &net_optim,
        &backbone_optim,
        &CheckpointMeta {
            step: config.total_steps,
            trained_steps,
            skipped_steps,
        },
    )?;
    tracing::info!("Training complete. Final checkpoint saved.");

    Ok(policy)
}

/// Load a reference policy from a checkpoint directory.
///
/// Builds a fresh policy from `config`, then loads `net` and `backbone`
/// weights from `dir` on top.
pub fn resume_from_checkpoint<B: Backend>(
    dir: &Path,
    config: &PolicyConfig,
    device: &B::Device,
) -> anyhow::Result<DiffusionPolicy<B, PointMlpBackbone<B>, DdpmScheduler>> {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let policy = DiffusionPolicy::<B, PointMlpBackbone<B>, DdpmScheduler>::reference(config.clone(), device)?;
    let (config, net, backbone, scheduler) = policy.into_parts();

    let net = net
        .load_file(dir.join("net"), &recorder, device)
        .map_err(|e| anyhow!("Failed to load policy net from {}: {e}", dir.display()))?;
    let backbone = backbone
        .load_file(dir.join("backbone"), &recorder, device)
        .map_err(|e| anyhow!("Failed to load backbone from {}: {e}", dir.display()))?;

    Ok(DiffusionPolicy::from_parts(config, net, backbone, scheduler)?)
}
