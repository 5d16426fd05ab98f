//! Point-cloud backbone interface and the reference implementation.
//!
//! The policy runs a backbone in two shapes. Training encodes the primary
//! cloud and evaluates the neck on the noisy anchors in one call. Inference
//! encodes the primary cloud once, hands the encoding back as an explicit
//! cache handle, evaluates the neck on the anchors of each denoising step,
//! and finally consumes the handle.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::batch::{segment_max, PointBatch, PointFeatures};
use crate::error::{PolicyError, Result as PolicyResult};

/// A point-cloud encoder with a neck evaluated on anchor points.
///
/// `neck_inference(&cache, anchor)` must match the anchor output of
/// `forward_train(primary, anchor)` for the primary batch the cache was built
/// from, and must not depend on how many neck calls came before.
pub trait PointBackbone<B: Backend> {
    /// Encoding of one primary batch, reused across denoising steps.
    type Cache;

    /// Encoder layer outputs for `primary` and the neck output for `anchor`.
    fn forward_train(
        &self,
        primary: &PointBatch<B>,
        anchor: &PointBatch<B>,
    ) -> PolicyResult<(Vec<PointFeatures<B>>, PointFeatures<B>)>;

    /// Encoder layer outputs and the cache the neck will read.
    fn forward_inference(
        &self,
        primary: &PointBatch<B>,
    ) -> PolicyResult<(Vec<PointFeatures<B>>, Self::Cache)>;

    fn neck_inference(&self, cache: &Self::Cache, anchor: &PointBatch<B>) -> PolicyResult<PointFeatures<B>>;

    /// Release an encoding.
    fn clear_cache(&self, cache: Self::Cache);

    fn num_params(&self) -> usize;
}

/// Configuration for the [`PointMlpBackbone`].
#[derive(Config, Debug)]
pub struct PointMlpBackboneConfig {
    /// Per-point feature width.
    pub in_channels: usize,
    /// Width of the context rows injected at every layer.
    pub context_channels: usize,
    /// Hidden widths of the encoder before the output layer.
    #[config(default = "vec![64, 128]")]
    pub enc_channels: Vec<usize>,
    /// Width of the last encoder layer and of the neck output.
    #[config(default = 128)]
    pub hidden_size: usize,
}

impl PointMlpBackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PointMlpBackbone<B> {
        let widths: Vec<usize> = std::iter::once(self.in_channels)
            .chain(self.enc_channels.iter().copied())
            .chain(std::iter::once(self.hidden_size))
            .collect();
        let encoder = widths
            .windows(2)
            .map(|w| LinearConfig::new(w[0], w[1]).init(device))
            .collect();
        let encoder_ctx = widths[1..]
            .iter()
            .map(|&w| LinearConfig::new(self.context_channels, w).init(device))
            .collect();
        let h = self.hidden_size;
        PointMlpBackbone {
            encoder,
            encoder_ctx,
            anchor_fc: LinearConfig::new(3, h).init(device),
            anchor_ctx: LinearConfig::new(self.context_channels, h).init(device),
            neck_fc: LinearConfig::new(h, h).init(device),
            in_channels: self.in_channels,
        }
    }
}

/// PointNet-style reference backbone.
///
/// ```text
/// encoder: feat → [Linear + ctx_proj(ctx) → ReLU] per layer   (layer outputs returned)
/// global:  per-sample max over the last layer                 (the cache)
/// neck:    ReLU(anchor_fc(xyz) + anchor_ctx(ctx) + global[sample]) → neck_fc
/// ```
///
/// `grid_size` is ignored; there is no voxelization.
#[derive(Module, Debug)]
pub struct PointMlpBackbone<B: Backend> {
    encoder: Vec<Linear<B>>,
    encoder_ctx: Vec<Linear<B>>,
    anchor_fc: Linear<B>,
    anchor_ctx: Linear<B>,
    neck_fc: Linear<B>,
    in_channels: usize,
}

/// Cached encoding of a primary batch: one global code per sample.
#[derive(Debug, Clone)]
pub struct PointMlpCache<B: Backend> {
    global: Tensor<B, 2>,
}

impl<B: Backend> PointMlpCache<B> {
    pub fn num_samples(&self) -> usize {
        self.global.dims()[0]
    }
}

impl<B: Backend> PointMlpBackbone<B> {
    fn encode(&self, primary: &PointBatch<B>) -> PolicyResult<(Vec<PointFeatures<B>>, PointMlpCache<B>)> {
        let [_, width] = primary.feat.dims();
        if width != self.in_channels {
            return Err(PolicyError::MalformedBatch(format!(
                "backbone expects {} feature columns, got {width}",
                self.in_channels
            )));
        }
        let ctx = primary.context_per_point()?;

        let mut x = primary.feat.clone();
        let mut layers = Vec::with_capacity(self.encoder.len());
        for (fc, ctx_fc) in self.encoder.iter().zip(&self.encoder_ctx) {
            x = fc.forward(x);
            if let Some(ctx) = &ctx {
                x = x + ctx_fc.forward(ctx.clone());
            }
            x = relu(x);
            layers.push(PointFeatures {
                feat: x.clone(),
                offset: primary.offset.clone(),
            });
        }

        let global = segment_max(x, &primary.offset);
        Ok((layers, PointMlpCache { global }))
    }

    fn neck(&self, cache: &PointMlpCache<B>, anchor: &PointBatch<B>) -> PolicyResult<PointFeatures<B>> {
        if anchor.offset.num_samples() != cache.num_samples() {
            return Err(PolicyError::MalformedBatch(format!(
                "anchor batch has {} samples, encoding has {}",
                anchor.offset.num_samples(),
                cache.num_samples()
            )));
        }
        let [_, width] = anchor.feat.dims();
        if width != 3 {
            return Err(PolicyError::MalformedBatch(format!(
                "anchor features must be xyz, got width {width}"
            )));
        }

        let mut x = self.anchor_fc.forward(anchor.feat.clone())
            + cache.global.clone().select(0, anchor.batch.clone());
        if let Some(ctx) = anchor.context_per_point()? {
            x = x + self.anchor_ctx.forward(ctx);
        }
        let feat = self.neck_fc.forward(relu(x));
        Ok(PointFeatures {
            feat,
            offset: anchor.offset.clone(),
        })
    }
}

impl<B: Backend> PointBackbone<B> for PointMlpBackbone<B> {
    type Cache = PointMlpCache<B>;

    fn forward_train(
        &self,
        primary: &PointBatch<B>,
        anchor: &PointBatch<B>,
    ) -> PolicyResult<(Vec<PointFeatures<B>>, PointFeatures<B>)> {
        let (layers, cache) = self.encode(primary)?;
        let anchor_out = self.neck(&cache, anchor)?;
        Ok((layers, anchor_out))
    }

    fn forward_inference(
        &self,
        primary: &PointBatch<B>,
    ) -> PolicyResult<(Vec<PointFeatures<B>>, Self::Cache)> {
        self.encode(primary)
    }

    fn neck_inference(&self, cache: &Self::Cache, anchor: &PointBatch<B>) -> PolicyResult<PointFeatures<B>> {
        self.neck(cache, anchor)
    }

    fn clear_cache(&self, cache: Self::Cache) {
        drop(cache);
    }

    fn num_params(&self) -> usize {
        <Self as Module<B>>::num_params(self)
    }
}
