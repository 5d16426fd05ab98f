//! Iterative denoising of positions and assembly of the final action.
//!
//! ```text
//! INIT       set timesteps; anchors = add_noise(0, ε, t_first)
//! ENCODING   forward_inference(primary) once → layers + cache
//! DENOISING  for t in timesteps (descending):
//!              ctx = pooled + temb(t); neck_inference; denoise; scheduler.step
//! FINALIZE   conditioned_rot(last layer, final position); decode; clear_cache
//! ```

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

use crate::batch::{ObservationBatch, PointFeatures};
use crate::error::{PolicyError, Result};
use crate::model::PointBackbone;
use crate::policy::DiffusionPolicy;
use crate::scheduler::NoiseScheduler;

/// Width of an action row: position 3, quaternion 4, openness logit 1.
pub const ACTION_WIDTH: usize = 8;
/// Action row plus the rotation and openness predicted from the
/// ground-truth position.
pub const DATASET_ACTION_WIDTH: usize = 13;

/// What `forward_n_steps` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferenceMode {
    /// `(B, 8)` actions.
    #[default]
    Deploy,
    /// `(B, 13)`: the deploy action followed by quaternion and openness
    /// conditioned on the ground-truth position. Needs `gt_actions`.
    DatasetInspection,
}

impl<B: Backend, N: PointBackbone<B>, S: NoiseScheduler> DiffusionPolicy<B, N, S> {
    /// Predict actions by walking the full reverse schedule.
    ///
    /// The primary point cloud is encoded once. Its cache is released
    /// exactly once, after the rotation for the final position has been
    /// predicted, and also when any step fails.
    ///
    /// On an autodiff backend every step is recorded in the graph. Call
    /// [`DiffusionPolicy::valid`] first to sample on the inner backend.
    pub fn forward_n_steps(
        &mut self,
        batch: &ObservationBatch<B>,
        mode: InferenceMode,
    ) -> Result<Tensor<B, 2>> {
        batch.validate()?;
        let device = batch.pc_fts.device();
        let b = batch.num_samples();
        let gt_pos = match mode {
            InferenceMode::Deploy => None,
            InferenceMode::DatasetInspection => Some(
                batch
                    .require_gt_actions_width(self.codec.gt_width())?
                    .clone()
                    .slice([0..b, 0..3]),
            ),
        };

        self.scheduler.set_timesteps(self.config.diffusion.num_inference_steps())?;
        let timesteps = self.scheduler.timesteps().to_vec();
        let first = *timesteps
            .first()
            .ok_or_else(|| PolicyError::InvalidConfig("empty inference schedule".into()))?;

        let noise = Tensor::<B, 2>::random([b, 3], Distribution::Normal(0.0, 1.0), &device);
        let anchors = self
            .scheduler
            .add_noise(Tensor::zeros([b, 3], &device), noise, &vec![first; b])?;

        let primary = self.prepare_primary(batch)?;
        let pooled = self.net.context.pooled_context(batch)?;

        let (layers, cache) = self.backbone.forward_inference(&primary)?;
        let result = self.denoise_and_finalize(&cache, &layers, anchors, pooled, &timesteps, batch, gt_pos);
        self.backbone.clear_cache(cache);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn denoise_and_finalize(
        &self,
        cache: &N::Cache,
        layers: &[PointFeatures<B>],
        mut coord: Tensor<B, 2>,
        pooled: Tensor<B, 2>,
        timesteps: &[usize],
        batch: &ObservationBatch<B>,
        gt_pos: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>> {
        let device = coord.device();
        let b = batch.num_samples();

        for &t in timesteps {
            let context = pooled.clone() + self.temb.embed_steps::<B>(&vec![t; b], &device);
            let anchor = self.anchor_batch(coord.clone(), context, b, 1)?;
            let anchor_out = self.backbone.neck_inference(cache, &anchor)?;
            let pred = self.net.head.denoise(anchor_out.feat);
            coord = self.scheduler.step(pred, t, coord)?;
            tracing::debug!(timestep = t, "Denoising step");
        }

        let last = layers
            .last()
            .ok_or_else(|| PolicyError::MalformedBatch("backbone returned no point layers".into()))?;
        let (rot, open) = self
            .net
            .head
            .conditioned_rot(last.feat.clone(), &last.offset, coord.clone())?;
        let quat = self.codec.decode(rot, batch.ee_poses.as_ref())?;
        let mut parts = vec![coord, quat, open.unsqueeze_dim::<2>(1)];

        if let Some(gt_pos) = gt_pos {
            let (rot_gt, open_gt) = self
                .net
                .head
                .conditioned_rot(last.feat.clone(), &last.offset, gt_pos)?;
            parts.push(self.codec.decode(rot_gt, batch.ee_poses.as_ref())?);
            parts.push(open_gt.unsqueeze_dim::<2>(1));
        }
        Ok(Tensor::cat(parts, 1))
    }
}


impl<B, N, S> DiffusionPolicy<B, N, S>
where
    B: AutodiffBackend,
    N: PointBackbone<B> + AutodiffModule<B>,
    N::InnerModule: PointBackbone<B::InnerBackend>,
    S: NoiseScheduler + Clone,
{
    /// Copy of the policy on the inner backend, sharing the current weights.
    pub fn valid(&self) -> DiffusionPolicy<B::InnerBackend, N::InnerModule, S> {
        DiffusionPolicy {
            net: self.net.valid(),
            backbone: self.backbone.valid(),
            scheduler: self.scheduler.clone(),
            config: self.config.clone(),
            codec: self.codec,
            temb: self.temb,
        }
    }
}
