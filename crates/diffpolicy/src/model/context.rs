//! Conditioning context: text projection plus pose and step embeddings.
//!
//! Two shapes are produced from the same observation:
//!
//! - [`ContextAssembler::token_context`]: every projected text token, with
//!   the pose and step embeddings appended as extra tokens per sample. This
//!   conditions the primary point-cloud stream.
//! - [`ContextAssembler::pooled_context`]: one vector per sample from
//!   attention pooling over the tokens, with pose and step embeddings added.
//!   This conditions the diffusion anchors.

use burn::nn::{Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::TensorData;

use crate::batch::{ObservationBatch, Offsets};
use crate::error::{PolicyError, Result as PolicyResult};
use crate::model::bridge::{int_tensor_to_vec, tensor_to_vec};
use crate::rotation::math::quat_to_euler;

/// Embeds an end-effector pose `(xyz, quat xyzw [, openness])`.
///
/// ```text
/// pos_fc(xyz) + rot_fc([sin(euler), cos(euler)]) [+ open_embedding(openness)]
///   → LayerNorm
/// ```
#[derive(Module, Debug)]
pub struct PoseEmbedding<B: Backend> {
    pos_fc: Linear<B>,
    rot_fc: Linear<B>,
    open_embedding: Embedding<B>,
    norm: LayerNorm<B>,
}

impl<B: Backend> PoseEmbedding<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            pos_fc: LinearConfig::new(3, channels).init(device),
            rot_fc: LinearConfig::new(6, channels).init(device),
            open_embedding: EmbeddingConfig::new(2, channels).init(device),
            norm: LayerNormConfig::new(channels).init(device),
        }
    }

    /// `(B, >=7)` poses to `(B, C)` embeddings.
    ///
    /// Euler angles are computed on the host; the openness column (8th) is
    /// thresholded at 0.5 when present.
    pub fn forward(&self, poses: Tensor<B, 2>) -> PolicyResult<Tensor<B, 2>> {
        let device = poses.device();
        let [batch, width] = poses.dims();
        if width < 7 {
            return Err(PolicyError::MalformedBatch(format!(
                "ee_poses needs at least 7 columns, got {width}"
            )));
        }

        let host = tensor_to_vec(poses.clone())?;
        let mut rot_feats = Vec::with_capacity(batch * 6);
        let mut open_ids = Vec::with_capacity(batch);
        for row in host.chunks_exact(width) {
            let euler = quat_to_euler([row[3], row[4], row[5], row[6]]).map(f32::to_radians);
            rot_feats.extend(euler.iter().map(|a| a.sin()));
            rot_feats.extend(euler.iter().map(|a| a.cos()));
            if width >= 8 {
                open_ids.push(i64::from(row[7] > 0.5));
            }
        }

        let pos = self.pos_fc.forward(poses.slice([0..batch, 0..3]));
        let rot_feats = Tensor::<B, 2>::from_data(TensorData::new(rot_feats, [batch, 6]), &device);
        let mut x = pos + self.rot_fc.forward(rot_feats);

        if width >= 8 {
            let ids = Tensor::<B, 2, Int>::from_data(TensorData::new(open_ids, [batch, 1]), &device);
            let open = self.open_embedding.forward(ids);
            let [b, _, c] = open.dims();
            x = x + open.reshape([b, c]);
        }

        Ok(self.norm.forward(x))
    }
}

/// Configuration for the [`ContextAssembler`].
#[derive(Config, Debug)]
pub struct ContextAssemblerConfig {
    /// Width of the incoming text-token embeddings.
    pub txt_ft_size: usize,
    /// Width of every produced context vector.
    pub context_channels: usize,
    /// Build the attention-pooling projection.
    #[config(default = true)]
    pub txt_attn: bool,
    #[config(default = true)]
    pub use_ee_pose: bool,
    #[config(default = false)]
    pub use_step_id: bool,
    #[config(default = 30)]
    pub max_steps: usize,
}

impl ContextAssemblerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ContextAssembler<B> {
        ContextAssembler {
            txt_fc: LinearConfig::new(self.txt_ft_size, self.context_channels).init(device),
            txt_attn_fc: self
                .txt_attn
                .then(|| LinearConfig::new(self.txt_ft_size, 1).init(device)),
            pose: self
                .use_ee_pose
                .then(|| PoseEmbedding::new(self.context_channels, device)),
            step: self
                .use_step_id
                .then(|| EmbeddingConfig::new(self.max_steps, self.context_channels).init(device)),
            max_steps: self.max_steps,
        }
    }
}

#[derive(Module, Debug)]
pub struct ContextAssembler<B: Backend> {
    txt_fc: Linear<B>,
    txt_attn_fc: Option<Linear<B>>,
    pose: Option<PoseEmbedding<B>>,
    step: Option<Embedding<B>>,
    max_steps: usize,
}

impl<B: Backend> ContextAssembler<B> {
    /// Token context and its per-sample offsets.
    ///
    /// Sample `i` contributes `txt_lens[i]` projected tokens followed by its
    /// pose token and step token when those embeddings are enabled.
    pub fn token_context(&self, batch: &ObservationBatch<B>) -> PolicyResult<(Tensor<B, 2>, Offsets)> {
        let text = self.txt_fc.forward(batch.txt_embeds.clone());
        let extras = self.extra_embeddings(batch)?;
        let channels = text.dims()[1];

        let txt_offsets = Offsets::from_counts(&batch.txt_lens)?;
        let mut pieces = Vec::with_capacity(batch.num_samples() * (1 + extras.len()));
        for (i, span) in txt_offsets.spans().enumerate() {
            pieces.push(text.clone().slice([span, 0..channels]));
            for extra in &extras {
                pieces.push(extra.clone().slice([i..i + 1, 0..channels]));
            }
        }

        let lens: Vec<usize> = batch.txt_lens.iter().map(|l| l + extras.len()).collect();
        Ok((Tensor::cat(pieces, 0), Offsets::from_counts(&lens)?))
    }

    /// One attention-pooled context vector per sample, `(B, C)`.
    ///
    /// # Errors
    /// `TxtReduceRequired` when the assembler was built without the
    /// attention projection.
    pub fn pooled_context(&self, batch: &ObservationBatch<B>) -> PolicyResult<Tensor<B, 2>> {
        let attn_fc = self.txt_attn_fc.as_ref().ok_or(PolicyError::TxtReduceRequired)?;
        let text = self.txt_fc.forward(batch.txt_embeds.clone());
        let logits = attn_fc.forward(batch.txt_embeds.clone());
        let channels = text.dims()[1];

        let txt_offsets = Offsets::from_counts(&batch.txt_lens)?;
        let pooled = txt_offsets
            .spans()
            .map(|span| {
                let weights = softmax(logits.clone().slice([span.clone(), 0..1]), 0);
                (text.clone().slice([span, 0..channels]) * weights).sum_dim(0)
            })
            .collect::<Vec<_>>();

        let mut ctx = Tensor::cat(pooled, 0);
        for extra in self.extra_embeddings(batch)? {
            ctx = ctx + extra;
        }
        Ok(ctx)
    }

    /// Pose and step embeddings `(B, C)` in that order, for those enabled.
    fn extra_embeddings(&self, batch: &ObservationBatch<B>) -> PolicyResult<Vec<Tensor<B, 2>>> {
        let mut extras = Vec::with_capacity(2);
        if let Some(pose) = &self.pose {
            extras.push(pose.forward(batch.require_ee_poses()?.clone())?);
        }
        if let Some(step) = &self.step {
            let ids = batch.require_step_ids()?.clone();
            let host = int_tensor_to_vec(ids.clone())?;
            if let Some(&bad) = host.iter().find(|&&s| s < 0 || s as usize >= self.max_steps) {
                return Err(PolicyError::MalformedBatch(format!(
                    "step id {bad} outside [0, {})",
                    self.max_steps
                )));
            }
            let out = step.forward(ids.unsqueeze_dim::<2>(1));
            let [b, _, c] = out.dims();
            extras.push(out.reshape([b, c]));
        }
        Ok(extras)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn batch(device: &<TestBackend as Backend>::Device, pose_width: usize) -> ObservationBatch<TestBackend> {
        let mut pose = vec![0.0_f32; 2 * pose_width];
        pose[6] = 1.0;
        pose[pose_width + 6] = 1.0;
        ObservationBatch {
            pc_fts: Tensor::zeros([12, 6], device),
            offset: Offsets::new(vec![5, 12]).unwrap(),
            txt_embeds: Tensor::random([3, 8], Distribution::Normal(0.0, 1.0), device),
            txt_lens: vec![1, 2],
            ee_poses: Some(Tensor::from_data(TensorData::new(pose, [2, pose_width]), device)),
            step_ids: Some(Tensor::from_data(TensorData::from([0_i64, 3]), device)),
            gt_actions: None,
        }
    }

    #[test]
    fn test_token_context_appends_extras() {
        let device = Default::default();
        let assembler = ContextAssemblerConfig::new(8, 4)
            .with_use_step_id(true)
            .with_max_steps(5)
            .init::<TestBackend>(&device);
        let (tokens, offsets) = assembler.token_context(&batch(&device, 8)).unwrap();
        // [1 text + pose + step, 2 text + pose + step]
        assert_eq!(offsets.as_slice(), &[3, 7]);
        assert_eq!(tokens.dims(), [7, 4]);
    }

    #[test]
    fn test_token_context_text_only() {
        let device = Default::default();
        let assembler = ContextAssemblerConfig::new(8, 4)
            .with_use_ee_pose(false)
            .init::<TestBackend>(&device);
        let mut b = batch(&device, 7);
        b.ee_poses = None;
        let (tokens, offsets) = assembler.token_context(&b).unwrap();
        assert_eq!(offsets.as_slice(), &[1, 3]);
        assert_eq!(tokens.dims(), [3, 4]);
    }

    #[test]
    fn test_pooled_context_single_token_is_projection() {
        let device = Default::default();
        let assembler = ContextAssemblerConfig::new(8, 4)
            .with_use_ee_pose(false)
            .init::<TestBackend>(&device);
        let b = batch(&device, 7);
        let pooled = assembler.pooled_context(&b).unwrap();
        assert_eq!(pooled.dims(), [2, 4]);

        // Softmax over a single token is 1, so sample 0 is just txt_fc(token 0).
        let projected = assembler.txt_fc.forward(b.txt_embeds.slice([0..1, 0..8]));
        let diff: f32 = (pooled.slice([0..1, 0..4]) - projected).abs().sum().into_scalar().elem();
        assert!(diff < 1e-5, "diff={diff}");
    }

    #[test]
    fn test_pooled_context_requires_attention() {
        let device = Default::default();
        let assembler = ContextAssemblerConfig::new(8, 4)
            .with_txt_attn(false)
            .init::<TestBackend>(&device);
        assert!(matches!(
            assembler.pooled_context(&batch(&device, 7)),
            Err(PolicyError::TxtReduceRequired)
        ));
    }

    #[test]
    fn test_missing_pose_and_bad_step() {
        let device = Default::default();
        let assembler = ContextAssemblerConfig::new(8, 4)
            .with_use_step_id(true)
            .with_max_steps(2)
            .init::<TestBackend>(&device);

        let mut b = batch(&device, 7);
        assert!(matches!(
            assembler.pooled_context(&b),
            Err(PolicyError::MalformedBatch(_))
        ));

        b.ee_poses = None;
        assert!(matches!(
            assembler.pooled_context(&b),
            Err(PolicyError::MissingField("ee_poses"))
        ));
    }

    #[test]
    fn test_pose_embedding_shape_and_openness() {
        let device = Default::default();
        let pose = PoseEmbedding::<TestBackend>::new(4, &device);
        let closed = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1_f32, 0.2, 0.3, 0.0, 0.0, 0.0, 1.0, 0.0]]),
            &device,
        );
        let open = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1_f32, 0.2, 0.3, 0.0, 0.0, 0.0, 1.0, 1.0]]),
            &device,
        );
        let a = pose.forward(closed).unwrap();
        let b = pose.forward(open).unwrap();
        assert_eq!(a.dims(), [1, 4]);
        let diff: f32 = (a - b).abs().sum().into_scalar().elem();
        assert!(diff > 1e-6, "openness should change the embedding");
    }
}
