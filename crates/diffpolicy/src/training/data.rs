//! Synthetic observation batches.
//!
//! Generates ragged point clouds, text tokens, end-effector poses, step ids
//! and ground-truth actions that satisfy every batch invariant, with rotation
//! targets encoded for the configured parameterization. The target position
//! sits at the centre of a dense cluster of points so the task is learnable.

use rand::Rng;

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::batch::{ObservationBatch, Offsets};
use crate::config::PolicyConfig;
use crate::error::{PolicyError, Result};
use crate::rotation::math::{normalize_quat, Quat};
use crate::rotation::RotationCodec;

/// Pose rows carry position, quaternion and openness.
pub const POSE_WIDTH: usize = 8;

/// Random batch generator shaped by a [`PolicyConfig`].
#[derive(Debug, Clone)]
pub struct SyntheticSampler {
    in_channels: usize,
    txt_ft_size: usize,
    max_steps: usize,
    codec: RotationCodec,
    points: (usize, usize),
    tokens: (usize, usize),
}

impl SyntheticSampler {
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        let codec = RotationCodec::new(config.action.rot_pred_type, config.action.euler_resolution)?;
        Ok(Self {
            in_channels: config.backbone.in_channels,
            txt_ft_size: config.action.txt_ft_size,
            max_steps: config.action.max_steps.max(1),
            codec,
            points: (16, 64),
            tokens: (1, 4),
        })
    }

    /// Inclusive range of points per sample.
    pub fn with_points(mut self, min: usize, max: usize) -> Self {
        self.points = (min.max(1), max.max(min.max(1)));
        self
    }

    /// Inclusive range of text tokens per sample.
    pub fn with_tokens(mut self, min: usize, max: usize) -> Self {
        self.tokens = (min.max(1), max.max(min.max(1)));
        self
    }

    /// Targets width: position, rotation target, openness.
    pub fn action_width(&self) -> usize {
        3 + self.codec.target_width() + 1
    }

    pub fn sample_batch<B: Backend>(
        &self,
        batch_size: usize,
        rng: &mut impl Rng,
        device: &B::Device,
    ) -> Result<ObservationBatch<B>> {
        if batch_size == 0 {
            return Err(PolicyError::MalformedBatch("batch_size must be > 0".into()));
        }

        let mut counts = Vec::with_capacity(batch_size);
        let mut txt_lens = Vec::with_capacity(batch_size);
        let mut pc_fts = Vec::new();
        let mut txt = Vec::new();
        let mut poses = Vec::with_capacity(batch_size * POSE_WIDTH);
        let mut steps = Vec::with_capacity(batch_size);
        let mut actions = Vec::with_capacity(batch_size * self.action_width());

        for _ in 0..batch_size {
            let target: [f32; 3] = [0; 3].map(|_| rng.gen_range(-0.5..0.5));

            let n = rng.gen_range(self.points.0..=self.points.1);
            counts.push(n);
            for i in 0..n {
                // Half of the points cluster around the target.
                let (centre, spread) = if i % 2 == 0 { (target, 0.05) } else { ([0.0; 3], 1.0) };
                for c in centre {
                    pc_fts.push(c + rng.gen_range(-spread..spread));
                }
                for _ in 3..self.in_channels {
                    pc_fts.push(rng.gen_range(0.0..1.0));
                }
            }

            let len = rng.gen_range(self.tokens.0..=self.tokens.1);
            txt_lens.push(len);
            txt.extend((0..len * self.txt_ft_size).map(|_| rng.gen_range(-1.0_f32..1.0)));

            let current = random_quat(rng);
            poses.extend([0; 3].map(|_| rng.gen_range(-0.5_f32..0.5)));
            poses.extend(current);
            poses.push(rng.gen_range(0..2) as f32);

            steps.push(rng.gen_range(0..self.max_steps) as i64);

            actions.extend(target);
            actions.extend(self.codec.encode_target(random_quat(rng), Some(current))?);
            actions.push(rng.gen_range(0..2) as f32);
        }

        let n_points: usize = counts.iter().sum();
        let n_tokens: usize = txt_lens.iter().sum();
        Ok(ObservationBatch {
            pc_fts: Tensor::from_data(TensorData::new(pc_fts, [n_points, self.in_channels]), device),
            offset: Offsets::from_counts(&counts)?,
            txt_embeds: Tensor::from_data(TensorData::new(txt, [n_tokens, self.txt_ft_size]), device),
            txt_lens,
            ee_poses: Some(Tensor::from_data(TensorData::new(poses, [batch_size, POSE_WIDTH]), device)),
            step_ids: Some(Tensor::from_data(TensorData::new(steps, [batch_size]), device)),
            gt_actions: Some(Tensor::from_data(
                TensorData::new(actions, [batch_size, self.action_width()]),
                device,
            )),
        })
    }
}

fn random_quat(rng: &mut impl Rng) -> Quat {
    loop {
        let q: Quat = [0; 4].map(|_| rng.gen_range(-1.0_f32..1.0));
        let n2: f32 = q.iter().map(|v| v * v).sum();
        // Rejection sampling inside the unit ball gives a uniform direction.
        if n2 > 1e-4 && n2 <= 1.0 {
            return normalize_quat(q);
        }
    }
}
