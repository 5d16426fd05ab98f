use burn::prelude::*;

use crate::config::RotPredType;
use crate::error::{PolicyError, Result};
use crate::model::bridge::{int_tensor_to_vec, rows_to_tensor, tensor_to_rows};
use crate::rotation::math::{
    bins_to_quat, euler_to_bins, euler_to_quat, matrix_to_ortho6d, matrix_to_quat, normalize_quat,
    ortho6d_to_matrix, quat_to_euler, quat_to_matrix, wrap_degrees, Quat,
};

/// Rotation slice of the action head output.
#[derive(Debug, Clone)]
pub enum RotationOutput<B: Backend> {
    /// `(B, width)` regression output; quaternions are already unit-norm.
    Continuous(Tensor<B, 2>),
    /// `(B, bins, 3)` logits, one categorical per euler axis.
    Binned(Tensor<B, 3>),
}

impl<B: Backend> RotationOutput<B> {
    pub fn num_samples(&self) -> usize {
        match self {
            Self::Continuous(t) => t.dims()[0],
            Self::Binned(t) => t.dims()[0],
        }
    }
}

/// Encoding, decoding and target preparation for one rotation
/// parameterization, fixed when the policy is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationCodec {
    kind: RotPredType,
    resolution: usize,
}

impl RotationCodec {
    /// # Errors
    /// `InvalidConfig` unless `resolution` divides 360.
    pub fn new(kind: RotPredType, resolution: usize) -> Result<Self> {
        if resolution == 0 || 360 % resolution != 0 {
            return Err(PolicyError::InvalidConfig(format!(
                "euler_resolution must divide 360, got {resolution}"
            )));
        }
        Ok(Self { kind, resolution })
    }

    pub fn kind(&self) -> RotPredType {
        self.kind
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn bins(&self) -> usize {
        360 / self.resolution
    }

    /// Columns of the head output that belong to the rotation.
    pub fn raw_width(&self) -> usize {
        self.kind.raw_width(self.bins())
    }

    /// Rotation columns in `gt_actions`.
    pub fn target_width(&self) -> usize {
        self.kind.target_width()
    }

    /// Columns of a `gt_actions` row: position, rotation target, openness.
    pub fn gt_width(&self) -> usize {
        3 + self.target_width() + 1
    }

    /// Whether decoding leaves the device.
    pub(crate) fn requires_host(&self) -> bool {
        !matches!(self.kind, RotPredType::Quat)
    }

    /// Cut the rotation slice out of a raw head output `(B, >= raw_width)`.
    pub fn split<B: Backend>(&self, head_out: Tensor<B, 2>) -> RotationOutput<B> {
        let [batch, _] = head_out.dims();
        let rot = head_out.slice([0..batch, 0..self.raw_width()]);
        match self.kind {
            RotPredType::Quat => {
                let norm = rot.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
                RotationOutput::Continuous(rot / norm)
            }
            RotPredType::Rot6d | RotPredType::Euler | RotPredType::EulerDelta => {
                RotationOutput::Continuous(rot)
            }
            RotPredType::EulerDisc => RotationOutput::Binned(rot.reshape([batch, self.bins(), 3])),
        }
    }

    /// Decode a head output to `(B, 4)` quaternions.
    ///
    /// Host-side parameterizations read the output back once and return a
    /// tensor detached from the graph. `euler_delta` needs the current poses
    /// `(B, >=7)`.
    pub fn decode<B: Backend>(
        &self,
        output: RotationOutput<B>,
        ee_poses: Option<&Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>> {
        if !self.requires_host() {
            return match output {
                RotationOutput::Continuous(q) => Ok(q),
                RotationOutput::Binned(_) => Err(self.shape_mismatch()),
            };
        }
        let device = match &output {
            RotationOutput::Continuous(t) => t.device(),
            RotationOutput::Binned(t) => t.device(),
        };
        let quats: Vec<Quat> = match (self.kind, output) {
            (RotPredType::Rot6d, RotationOutput::Continuous(x)) => tensor_to_rows::<B, 6>(x)?
                .into_iter()
                .map(|six| matrix_to_quat(ortho6d_to_matrix(six)))
                .collect(),
            (RotPredType::Euler, RotationOutput::Continuous(x)) => tensor_to_rows::<B, 3>(x)?
                .into_iter()
                .map(|e| euler_to_quat(e.map(|a| a * 180.0)))
                .collect(),
            (RotPredType::EulerDelta, RotationOutput::Continuous(x)) => {
                let poses = ee_poses.ok_or(PolicyError::MissingField("ee_poses"))?;
                let [batch, _] = poses.dims();
                let current = poses.clone().slice([0..batch, 3..7]);
                // Delta and current quaternion in one read.
                tensor_to_rows::<B, 7>(Tensor::cat(vec![x, current], 1))?
                    .into_iter()
                    .map(|row| {
                        let base = quat_to_euler([row[3], row[4], row[5], row[6]]);
                        euler_to_quat([
                            row[0] * 180.0 + base[0],
                            row[1] * 180.0 + base[1],
                            row[2] * 180.0 + base[2],
                        ])
                    })
                    .collect()
            }
            (RotPredType::EulerDisc, RotationOutput::Binned(logits)) => {
                let [batch, _, _] = logits.dims();
                let idx = int_tensor_to_vec(logits.argmax(1).reshape([batch * 3]))?;
                idx.chunks_exact(3)
                    .map(|b| bins_to_quat([b[0] as usize, b[1] as usize, b[2] as usize], self.resolution))
                    .collect()
            }
            _ => return Err(self.shape_mismatch()),
        };
        rows_to_tensor(&quats, &device)
    }

    fn shape_mismatch(&self) -> PolicyError {
        PolicyError::MalformedBatch(format!(
            "rotation output shape does not match parameterization {}",
            self.kind
        ))
    }

    /// Target columns for a ground-truth orientation.
    ///
    /// `current` is the end-effector orientation the delta is measured from;
    /// only `euler_delta` reads it.
    pub fn encode_target(&self, target: Quat, current: Option<Quat>) -> Result<Vec<f32>> {
        let target = normalize_quat(target);
        Ok(match self.kind {
            RotPredType::Quat | RotPredType::Rot6d => target.to_vec(),
            RotPredType::Euler => quat_to_euler(target).map(|a| a / 180.0).to_vec(),
            RotPredType::EulerDelta => {
                let current = current.ok_or(PolicyError::MissingField("ee_poses"))?;
                let tgt = quat_to_euler(target);
                let cur = quat_to_euler(current);
                (0..3).map(|i| wrap_degrees(tgt[i] - cur[i]) / 180.0).collect()
            }
            RotPredType::EulerDisc => euler_to_bins(quat_to_euler(target), self.resolution)
                .map(|b| b as f32)
                .to_vec(),
        })
    }

    /// Quaternion targets `(B, 4)` to 6D targets `(B, 6)` on the host.
    pub fn rot6d_targets<B: Backend>(&self, quats: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let device = quats.device();
        let six: Vec<[f32; 6]> = tensor_to_rows::<B, 4>(quats)?
            .into_iter()
            .map(|q| matrix_to_ortho6d(quat_to_matrix(q)))
            .collect();
        rows_to_tensor(&six, &device)
    }
}
