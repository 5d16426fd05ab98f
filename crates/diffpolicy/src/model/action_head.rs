use burn::module::Ignored;
use burn::nn::{Dropout, DropoutConfig, LeakyRelu, LeakyReluConfig, Linear, LinearConfig};
use burn::prelude::*;

use crate::batch::{segment_max, Offsets};
use crate::config::Reduce;
use crate::error::{PolicyError, Result as PolicyResult};
use crate::rotation::{RotationCodec, RotationOutput};

/// Configuration for the [`ActionHead`].
///
/// ```text
/// denoise:         (N, H) → Linear(H→H) → LeakyReLU(0.02) → Dropout → Linear(H→3)
/// conditioned_rot: pool(points) ⊕ pos (B, H+3)
///                    → Linear(H+3→H) → LeakyReLU(0.02) → Dropout → Linear(H→out)
/// ```
///
/// `out` is the rotation width plus the openness logit, plus one more
/// column when `reduce = attn`.
#[derive(Config, Debug)]
pub struct ActionHeadConfig {
    /// Point feature width of the backbone's last layer.
    pub hidden_size: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl ActionHeadConfig {
    pub fn init<B: Backend>(
        &self,
        reduce: Reduce,
        codec: RotationCodec,
        device: &B::Device,
    ) -> ActionHead<B> {
        let h = self.hidden_size;
        let mut out = codec.raw_width() + 1;
        if reduce == Reduce::Attn {
            out += 1;
        }
        ActionHead {
            action_fc1: LinearConfig::new(h + 3, h).init(device),
            action_fc2: LinearConfig::new(h, out).init(device),
            action_dropout: DropoutConfig::new(self.dropout).init(),
            denoise_fc1: LinearConfig::new(h, h).init(device),
            denoise_fc2: LinearConfig::new(h, 3).init(device),
            denoise_dropout: DropoutConfig::new(self.dropout).init(),
            activation: LeakyReluConfig::new().with_negative_slope(0.02).init(),
            reduce: Ignored(reduce),
            codec: Ignored(codec),
        }
    }
}

/// Noise prediction for anchors, rotation and openness for samples.
#[derive(Module, Debug)]
pub struct ActionHead<B: Backend> {
    action_fc1: Linear<B>,
    action_fc2: Linear<B>,
    action_dropout: Dropout,
    denoise_fc1: Linear<B>,
    denoise_fc2: Linear<B>,
    denoise_dropout: Dropout,
    activation: LeakyRelu,
    reduce: Ignored<Reduce>,
    codec: Ignored<RotationCodec>,
}

impl<B: Backend> ActionHead<B> {
    /// Per-anchor noise (or sample) prediction: `(N, H) -> (N, 3)`.
    pub fn denoise(&self, anchor_feat: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.denoise_fc1.forward(anchor_feat);
        let x = self.activation.forward(x);
        let x = self.denoise_dropout.forward(x);
        self.denoise_fc2.forward(x)
    }

    /// Rotation and openness logit per sample, conditioned on a position.
    ///
    /// `point_feat` is `(N, H)` delimited by `offsets`; `pos_condition` is
    /// `(B, 3)`. Returns the rotation slice and the `(B,)` openness logits.
    ///
    /// # Errors
    /// `NotImplemented` for every pooling mode except `max`.
    pub fn conditioned_rot(
        &self,
        point_feat: Tensor<B, 2>,
        offsets: &Offsets,
        pos_condition: Tensor<B, 2>,
    ) -> PolicyResult<(RotationOutput<B>, Tensor<B, 1>)> {
        let pooled = match *self.reduce {
            Reduce::Max => segment_max(point_feat, offsets),
            other => {
                return Err(PolicyError::NotImplemented(format!(
                    "reduce = {other:?} for conditioned rotation"
                )))
            }
        };
        let [batch, _] = pooled.dims();
        let [pos_rows, _] = pos_condition.dims();
        if pos_rows != batch {
            return Err(PolicyError::MalformedBatch(format!(
                "pos_condition has {pos_rows} rows for {batch} samples"
            )));
        }

        let x = Tensor::cat(vec![pooled, pos_condition], 1);
        let x = self.action_fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.action_dropout.forward(x);
        let action_embeds = self.action_fc2.forward(x);

        let [_, width] = action_embeds.dims();
        let openness = action_embeds
            .clone()
            .slice([0..batch, width - 1..width])
            .reshape([batch]);
        Ok((self.codec.split(action_embeds), openness))
    }

    pub fn codec(&self) -> &RotationCodec {
        &self.codec
    }
}
