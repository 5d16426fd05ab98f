//! The diffusion policy: trainable parts, backbone, scheduler, and the
//! training step.
//!
//! Position is denoised by the scheduler's reverse process; rotation and
//! openness are regressed per sample, conditioned on a position. The
//! inference loop lives in [`crate::inference`].

use burn::prelude::*;
use burn::tensor::Distribution;
use rand::Rng;
use serde::Serialize;

use crate::batch::{repeat_rows, ObservationBatch, Offsets, PointBatch};
use crate::config::{PolicyConfig, PredictionType};
use crate::error::{PolicyError, Result};
use crate::model::{
    ActionHead, ActionHeadConfig, ContextAssembler, ContextAssemblerConfig, PointBackbone,
    PointMlpBackbone, PointMlpBackboneConfig, SinusoidalTimestepEmbedding,
};
use crate::rotation::RotationCodec;
use crate::scheduler::{DdpmScheduler, NoiseScheduler};
use crate::training::loss::{compute_losses, PolicyLosses};

/// Std of the jitter added to ground-truth positions when conditioning the
/// rotation head during training.
pub const POS_CONDITION_JITTER: f64 = 0.01;

/// Trainable parts owned by the policy itself.
#[derive(Module, Debug)]
pub struct PolicyNet<B: Backend> {
    pub context: ContextAssembler<B>,
    pub head: ActionHead<B>,
}

impl<B: Backend> PolicyNet<B> {
    pub fn new(config: &PolicyConfig, codec: RotationCodec, device: &B::Device) -> Self {
        let act = &config.action;
        let context = ContextAssemblerConfig::new(act.txt_ft_size, act.context_channels)
            .with_use_ee_pose(act.use_ee_pose)
            .with_use_step_id(act.use_step_id)
            .with_max_steps(act.max_steps)
            .init(device);
        let head = ActionHeadConfig::new(config.backbone.hidden_size)
            .with_dropout(act.dropout)
            .init(act.reduce, codec, device);
        Self { context, head }
    }
}

/// Trainable parameter counts, per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamReport {
    pub backbone: usize,
    pub context: usize,
    pub action_head: usize,
    pub total: usize,
}

impl std::fmt::Display for ParamReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "backbone={} context={} action_head={} total={}",
            self.backbone, self.context, self.action_head, self.total
        )
    }
}

/// Diffusion policy over a point backbone `N` and a noise scheduler `S`.
pub struct DiffusionPolicy<B: Backend, N: PointBackbone<B>, S: NoiseScheduler = DdpmScheduler> {
    pub(crate) net: PolicyNet<B>,
    pub(crate) backbone: N,
    pub(crate) scheduler: S,
    pub(crate) config: PolicyConfig,
    pub(crate) codec: RotationCodec,
    pub(crate) temb: SinusoidalTimestepEmbedding,
}

impl<B: Backend> DiffusionPolicy<B, PointMlpBackbone<B>, DdpmScheduler> {
    /// Policy with the reference backbone and a DDPM scheduler, both built
    /// from `config`.
    pub fn reference(config: PolicyConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let backbone = PointMlpBackboneConfig::new(config.backbone.in_channels, config.action.context_channels)
            .with_enc_channels(config.backbone.enc_channels.clone())
            .with_hidden_size(config.backbone.hidden_size)
            .init(device);
        let scheduler = DdpmScheduler::new(&config.diffusion)?;
        Self::new(config, backbone, scheduler, device)
    }
}

impl<B: Backend, N: PointBackbone<B>, S: NoiseScheduler> DiffusionPolicy<B, N, S> {
    /// Validate `config` and build the trainable parts around the given
    /// backbone and scheduler.
    ///
    /// # Errors
    /// `InvalidConfig` or `TxtReduceRequired` for configurations the
    /// diffusion policy cannot run.
    pub fn new(config: PolicyConfig, backbone: N, scheduler: S, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let codec = RotationCodec::new(config.action.rot_pred_type, config.action.euler_resolution)?;
        let net = PolicyNet::new(&config, codec, device);
        Self::from_parts(config, net, backbone, scheduler)
    }

    /// Reassemble a policy from parts, e.g. after loading weights.
    pub fn from_parts(config: PolicyConfig, net: PolicyNet<B>, backbone: N, scheduler: S) -> Result<Self> {
        config.validate()?;
        let codec = RotationCodec::new(config.action.rot_pred_type, config.action.euler_resolution)?;
        if *net.head.codec() != codec {
            return Err(PolicyError::InvalidConfig(format!(
                "action head was built for {}, config asks for {}",
                net.head.codec().kind(),
                codec.kind()
            )));
        }
        let temb = SinusoidalTimestepEmbedding::new(config.action.context_channels);
        let policy = Self { net, backbone, scheduler, config, codec, temb };
        tracing::info!(rot_pred_type = %policy.codec.kind(), params = %policy.param_report(), "Built diffusion policy");
        Ok(policy)
    }

    pub fn into_parts(self) -> (PolicyConfig, PolicyNet<B>, N, S) {
        (self.config, self.net, self.backbone, self.scheduler)
    }

    /// Replace the trainable parts, e.g. with the result of an optimizer step.
    pub fn map_modules(self, f: impl FnOnce(PolicyNet<B>, N) -> (PolicyNet<B>, N)) -> Self {
        let (net, backbone) = f(self.net, self.backbone);
        Self { net, backbone, ..self }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn codec(&self) -> &RotationCodec {
        &self.codec
    }

    pub fn net(&self) -> &PolicyNet<B> {
        &self.net
    }

    pub fn backbone(&self) -> &N {
        &self.backbone
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn param_report(&self) -> ParamReport {
        let backbone = self.backbone.num_params();
        let context = self.net.context.num_params();
        let action_head = self.net.head.num_params();
        ParamReport {
            backbone,
            context,
            action_head,
            total: backbone + context + action_head,
        }
    }

    /// Pack an observation into the primary backbone input, conditioned on
    /// the token context.
    pub fn prepare_primary(&self, batch: &ObservationBatch<B>) -> Result<PointBatch<B>> {
        let [n, _] = batch.pc_fts.dims();
        let coord = batch.pc_fts.clone().slice([0..n, 0..3]);
        let (tokens, token_offset) = self.net.context.token_context(batch)?;
        Ok(PointBatch::new(
            coord,
            batch.pc_fts.clone(),
            batch.offset.clone(),
            self.config.action.voxel_size,
        )
        .with_context(tokens, Some(token_offset)))
    }

    /// Anchor batch of `k` positions per sample, with one context row per
    /// anchor. The anchor features are a copy of its coordinates.
    pub(crate) fn anchor_batch(
        &self,
        positions: Tensor<B, 2>,
        context: Tensor<B, 2>,
        num_samples: usize,
        k: usize,
    ) -> Result<PointBatch<B>> {
        let offset = Offsets::uniform(num_samples, k)?;
        Ok(PointBatch::new(positions.clone(), positions, offset, self.config.action.voxel_size)
            .with_context(context, None))
    }

    /// One training forward pass.
    ///
    /// Every ground-truth position is replicated `mini_batches` times with
    /// its own noise and timestep. The rotation head is conditioned on the
    /// ground-truth position plus a small jitter. No action is assembled, so
    /// the first element is always `None`.
    pub fn forward_train(
        &self,
        batch: &ObservationBatch<B>,
        rng: &mut impl Rng,
    ) -> Result<(Option<Tensor<B, 2>>, PolicyLosses<B>)> {
        batch.validate()?;
        let gt_actions = batch.require_gt_actions_width(self.codec.gt_width())?;
        let device = batch.pc_fts.device();
        let b = batch.num_samples();
        let k = self.config.mini_batches;

        let gt_pos = gt_actions.clone().slice([0..b, 0..3]);
        let gt_rep = repeat_rows(gt_pos.clone(), k);
        let noise = Tensor::<B, 2>::random([b * k, 3], Distribution::Normal(0.0, 1.0), &device);
        let total = self.scheduler.num_train_timesteps();
        let timesteps: Vec<usize> = (0..b * k).map(|_| rng.gen_range(0..total)).collect();
        let noisy = self.scheduler.add_noise(gt_rep.clone(), noise.clone(), &timesteps)?;

        let context = repeat_rows(self.net.context.pooled_context(batch)?, k)
            + self.temb.embed_steps::<B>(&timesteps, &device);
        let primary = self.prepare_primary(batch)?;
        let anchor = self.anchor_batch(noisy, context, b, k)?;

        let (layers, anchor_out) = self.backbone.forward_train(&primary, &anchor)?;
        let pred_pos = self.net.head.denoise(anchor_out.feat);

        let jitter = Tensor::<B, 2>::random([b, 3], Distribution::Normal(0.0, POS_CONDITION_JITTER), &device);
        let last = layers
            .last()
            .ok_or_else(|| PolicyError::MalformedBatch("backbone returned no point layers".into()))?;
        let (pred_rot, pred_open) =
            self.net
                .head
                .conditioned_rot(last.feat.clone(), &last.offset, gt_pos + jitter)?;

        let pos_target = match self.config.diffusion.prediction_type {
            PredictionType::Epsilon => noise,
            PredictionType::Sample => gt_rep,
        };
        let losses = compute_losses(
            &self.config.loss,
            &self.codec,
            pred_pos,
            pos_target,
            pred_rot,
            pred_open,
            gt_actions,
        )?;
        Ok((None, losses))
    }
}
