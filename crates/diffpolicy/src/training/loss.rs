//! Position, rotation and openness losses for diffusion policy training.
//!
//! All losses are computed on raw head outputs and reduce to shape `(1,)`.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::config::{LossConfig, PosMetric, RotPredType};
use crate::error::{PolicyError, Result};
use crate::model::bridge::tensor_to_f64;
use crate::rotation::{RotationCodec, RotationOutput};

/// Loss terms of one training step, still attached to the graph.
#[derive(Debug, Clone)]
pub struct PolicyLosses<B: Backend> {
    pub pos: Tensor<B, 1>,
    pub rot: Tensor<B, 1>,
    pub open: Tensor<B, 1>,
    /// `pos_weight * pos + rot_weight * rot + open`.
    pub total: Tensor<B, 1>,
}

/// Host copies of [`PolicyLosses`] for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct LossValues {
    pub pos: f64,
    pub rot: f64,
    pub open: f64,
    pub total: f64,
}

impl LossValues {
    pub fn is_finite(&self) -> bool {
        self.pos.is_finite() && self.rot.is_finite() && self.open.is_finite() && self.total.is_finite()
    }
}

impl<B: Backend> PolicyLosses<B> {
    pub fn values(&self) -> LossValues {
        LossValues {
            pos: tensor_to_f64(self.pos.clone()),
            rot: tensor_to_f64(self.rot.clone()),
            open: tensor_to_f64(self.open.clone()),
            total: tensor_to_f64(self.total.clone()),
        }
    }
}

/// Elementwise minimum of two same-shape tensors.
fn elementwise_min<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, D> {
    let a_smaller = a.clone().lower(b.clone());
    b.mask_where(a_smaller, a)
}

/// Position loss between predicted and injected noise (or clean sample).
pub fn position_loss<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>, metric: PosMetric) -> Tensor<B, 1> {
    let diff = pred - target;
    match metric {
        PosMetric::L2 => diff.powf_scalar(2.0).mean(),
        PosMetric::L1 => diff.abs().mean(),
    }
}

/// Sign-invariant quaternion loss.
///
/// Per sample, the smaller of `mse(p, q)` and `mse(p, -q)`; averaged over
/// the batch.
pub fn quat_loss<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let direct = (pred.clone() - target.clone()).powf_scalar(2.0).mean_dim(1);
    let flipped = (pred + target).powf_scalar(2.0).mean_dim(1);
    elementwise_min(direct, flipped).mean()
}

/// Euler loss on angles normalized by 180, matched across the ±1 wrap.
///
/// Each element takes the smaller squared error against the target and against
/// the target shifted by 2 towards the other side.
pub fn euler_wrap_loss<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    let shift = target.clone().lower_elem(0.0).float() * 2.0 - target.clone().greater_elem(0.0).float() * 2.0;
    let shifted = target.clone() + shift;
    let direct = (pred.clone() - target).powf_scalar(2.0);
    let wrapped = (pred - shifted).powf_scalar(2.0);
    elementwise_min(direct, wrapped).mean()
}

pub fn mse_loss<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    (pred - target).powf_scalar(2.0).mean()
}

/// Cross-entropy per euler axis, averaged over samples and axes.
///
/// `logits` is `(B, bins, 3)`; `target_bins` holds bin indices `(B, 3)` as
/// floats.
pub fn euler_disc_loss<B: Backend>(logits: Tensor<B, 3>, target_bins: Tensor<B, 2>) -> Tensor<B, 1> {
    let device = logits.device();
    let [batch, bins, axes] = logits.dims();
    let logits = logits.swap_dims(1, 2).reshape([batch * axes, bins]);
    let targets = target_bins.int().reshape([batch * axes]);
    CrossEntropyLossConfig::new().init(&device).forward(logits, targets)
}

/// Binary cross-entropy with logits, mean over the batch.
///
/// `max(x, 0) - x * y + log(1 + exp(-|x|))`.
pub fn openness_loss<B: Backend>(logits: Tensor<B, 1>, target: Tensor<B, 1>) -> Tensor<B, 1> {
    let stable = logits.clone().abs().neg().exp().log1p();
    (relu(logits.clone()) - logits * target + stable).mean()
}

/// Rotation loss for the codec's parameterization.
pub fn rotation_loss<B: Backend>(
    codec: &RotationCodec,
    pred: RotationOutput<B>,
    target: Tensor<B, 2>,
) -> Result<Tensor<B, 1>> {
    match (codec.kind(), pred) {
        (RotPredType::Quat, RotationOutput::Continuous(p)) => Ok(quat_loss(p, target)),
        (RotPredType::Rot6d, RotationOutput::Continuous(p)) => {
            Ok(mse_loss(p, codec.rot6d_targets(target)?))
        }
        (RotPredType::Euler, RotationOutput::Continuous(p)) => Ok(euler_wrap_loss(p, target)),
        (RotPredType::EulerDelta, RotationOutput::Continuous(p)) => Ok(mse_loss(p, target)),
        (RotPredType::EulerDisc, RotationOutput::Binned(logits)) => Ok(euler_disc_loss(logits, target)),
        (kind, _) => Err(PolicyError::MalformedBatch(format!(
            "rotation output shape does not match parameterization {kind}"
        ))),
    }
}

/// All loss terms for one step.
///
/// `gt_actions` is `(B, 3 + target_width + 1)`: position, rotation target,
/// openness. `pos_target` is what the denoise head should have predicted.
pub fn compute_losses<B: Backend>(
    config: &LossConfig,
    codec: &RotationCodec,
    pred_pos: Tensor<B, 2>,
    pos_target: Tensor<B, 2>,
    pred_rot: RotationOutput<B>,
    pred_open: Tensor<B, 1>,
    gt_actions: &Tensor<B, 2>,
) -> Result<PolicyLosses<B>> {
    let [batch, width] = gt_actions.dims();
    let expected = codec.gt_width();
    if width != expected {
        return Err(PolicyError::MalformedBatch(format!(
            "gt_actions width {width}, expected {expected} for {}",
            codec.kind()
        )));
    }
    let tgt_rot = gt_actions.clone().slice([0..batch, 3..width - 1]);
    let tgt_open = gt_actions.clone().slice([0..batch, width - 1..width]).reshape([batch]);

    let pos = position_loss(pred_pos, pos_target, config.pos_metric);
    let rot = rotation_loss(codec, pred_rot, tgt_rot)?;
    let open = openness_loss(pred_open, tgt_open);
    let total = pos.clone() * config.pos_weight + rot.clone() * config.rot_weight + open.clone();

    Ok(PolicyLosses { pos, rot, open, total })
}
