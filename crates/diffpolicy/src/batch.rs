//! Ragged point-cloud batches.
//!
//! Samples are concatenated along the first dimension and delimited by
//! cumulative counts ([`Offsets`]), never padded.

use std::ops::Range;

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{PolicyError, Result};

/// Cumulative per-sample counts: `[n1, n1+n2, ...]`, strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offsets(Vec<usize>);

impl Offsets {
    pub fn new(offsets: Vec<usize>) -> Result<Self> {
        if offsets.is_empty() {
            return Err(PolicyError::MalformedBatch("offset is empty".into()));
        }
        let mut prev = 0;
        for (i, &o) in offsets.iter().enumerate() {
            if o <= prev {
                return Err(PolicyError::MalformedBatch(format!(
                    "offset must be strictly increasing from 0, got {o} at index {i} after {prev}"
                )));
            }
            prev = o;
        }
        Ok(Self(offsets))
    }

    /// Build offsets from per-sample counts (each must be > 0).
    pub fn from_counts(counts: &[usize]) -> Result<Self> {
        let offsets = counts
            .iter()
            .scan(0usize, |acc, &c| {
                *acc += c;
                Some(*acc)
            })
            .collect();
        Self::new(offsets)
    }

    /// `k` entries for each of `num_samples` samples.
    pub fn uniform(num_samples: usize, k: usize) -> Result<Self> {
        Self::from_counts(&vec![k; num_samples])
    }

    pub fn num_samples(&self) -> usize {
        self.0.len()
    }

    /// Total number of entries (last offset).
    pub fn total(&self) -> usize {
        self.0.last().copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn counts(&self) -> Vec<usize> {
        self.spans().map(|r| r.len()).collect()
    }

    pub fn spans(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        let starts = std::iter::once(0).chain(self.0.iter().copied());
        starts.zip(self.0.iter().copied()).map(|(s, e)| s..e)
    }

    /// Sample index of every entry, e.g. `[0, 0, 1, 1, 1]` for `[2, 5]`.
    pub fn batch_index(&self) -> Vec<i64> {
        self.spans()
            .enumerate()
            .flat_map(|(i, r)| std::iter::repeat(i as i64).take(r.len()))
            .collect()
    }

    pub fn batch_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let index = self.batch_index();
        let n = index.len();
        Tensor::from_data(TensorData::new(index, [n]), device)
    }
}

/// Observation batch as delivered by the data pipeline.
#[derive(Debug, Clone)]
pub struct ObservationBatch<B: Backend> {
    /// Point features `(N, F)`; columns 0..3 are xyz.
    pub pc_fts: Tensor<B, 2>,
    /// Cumulative point counts per sample.
    pub offset: Offsets,
    /// Text token embeddings `(T, D)`.
    pub txt_embeds: Tensor<B, 2>,
    /// Tokens per sample; sums to `T`.
    pub txt_lens: Vec<usize>,
    /// End-effector poses `(B, >=7)`: xyz, quaternion xyzw, optional openness.
    pub ee_poses: Option<Tensor<B, 2>>,
    /// Episode step index per sample.
    pub step_ids: Option<Tensor<B, 1, Int>>,
    /// Targets `(B, 3 + rot_target_width + 1)`.
    pub gt_actions: Option<Tensor<B, 2>>,
}

impl<B: Backend> ObservationBatch<B> {
    pub fn num_samples(&self) -> usize {
        self.offset.num_samples()
    }

    /// Points per sample.
    pub fn npoints_in_batch(&self) -> Vec<usize> {
        self.offset.counts()
    }

    /// Check that every present field agrees with the offsets.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(PolicyError::MalformedBatch(msg));
        let n_samples = self.num_samples();

        let [n_points, n_feat] = self.pc_fts.dims();
        if n_points != self.offset.total() {
            return bad(format!(
                "pc_fts has {n_points} rows but offset ends at {}",
                self.offset.total()
            ));
        }
        if n_feat < 3 {
            return bad(format!("pc_fts needs xyz columns, got width {n_feat}"));
        }

        if self.txt_lens.len() != n_samples {
            return bad(format!(
                "txt_lens has {} entries for {n_samples} samples",
                self.txt_lens.len()
            ));
        }
        if self.txt_lens.iter().any(|&l| l == 0) {
            return bad("every sample needs at least one text token".into());
        }
        let n_tokens: usize = self.txt_lens.iter().sum();
        if n_tokens != self.txt_embeds.dims()[0] {
            return bad(format!(
                "txt_lens sum to {n_tokens} but txt_embeds has {} rows",
                self.txt_embeds.dims()[0]
            ));
        }

        if let Some(poses) = &self.ee_poses {
            let [rows, cols] = poses.dims();
            if rows != n_samples || cols < 7 {
                return bad(format!("ee_poses must be ({n_samples}, >=7), got ({rows}, {cols})"));
            }
        }
        if let Some(steps) = &self.step_ids {
            if steps.dims()[0] != n_samples {
                return bad(format!(
                    "step_ids has {} entries for {n_samples} samples",
                    steps.dims()[0]
                ));
            }
        }
        if let Some(gt) = &self.gt_actions {
            if gt.dims()[0] != n_samples {
                return bad(format!(
                    "gt_actions has {} rows for {n_samples} samples",
                    gt.dims()[0]
                ));
            }
        }
        Ok(())
    }

    pub fn require_ee_poses(&self) -> Result<&Tensor<B, 2>> {
        self.ee_poses.as_ref().ok_or(PolicyError::MissingField("ee_poses"))
    }

    pub fn require_step_ids(&self) -> Result<&Tensor<B, 1, Int>> {
        self.step_ids.as_ref().ok_or(PolicyError::MissingField("step_ids"))
    }

    pub fn require_gt_actions(&self) -> Result<&Tensor<B, 2>> {
        self.gt_actions.as_ref().ok_or(PolicyError::MissingField("gt_actions"))
    }

    /// `gt_actions`, checked to have exactly `width` columns.
    pub fn require_gt_actions_width(&self, width: usize) -> Result<&Tensor<B, 2>> {
        let gt = self.require_gt_actions()?;
        let cols = gt.dims()[1];
        if cols != width {
            return Err(PolicyError::MalformedBatch(format!(
                "gt_actions has {cols} columns, expected {width}"
            )));
        }
        Ok(gt)
    }
}

/// Input structure consumed by a point backbone.
#[derive(Debug, Clone)]
pub struct PointBatch<B: Backend> {
    pub coord: Tensor<B, 2>,
    pub feat: Tensor<B, 2>,
    pub offset: Offsets,
    /// Sample index per point.
    pub batch: Tensor<B, 1, Int>,
    pub grid_size: f64,
    /// Conditioning rows: per point, per sample, or tokens grouped by `context_offset`.
    pub context: Option<Tensor<B, 2>>,
    pub context_offset: Option<Offsets>,
}

impl<B: Backend> PointBatch<B> {
    pub fn new(coord: Tensor<B, 2>, feat: Tensor<B, 2>, offset: Offsets, grid_size: f64) -> Self {
        let batch = offset.batch_tensor::<B>(&coord.device());
        Self {
            coord,
            feat,
            offset,
            batch,
            grid_size,
            context: None,
            context_offset: None,
        }
    }

    pub fn with_context(mut self, context: Tensor<B, 2>, context_offset: Option<Offsets>) -> Self {
        self.context = Some(context);
        self.context_offset = context_offset;
        self
    }

    pub fn num_points(&self) -> usize {
        self.offset.total()
    }

    /// Broadcast the context to one row per point.
    ///
    /// Token contexts (with `context_offset`) are mean-pooled per sample
    /// first. Without offsets the context must have one row per point or one
    /// row per sample.
    pub fn context_per_point(&self) -> Result<Option<Tensor<B, 2>>> {
        let Some(context) = &self.context else {
            return Ok(None);
        };
        let rows = context.dims()[0];
        let n_samples = self.offset.num_samples();

        if let Some(ctx_offset) = &self.context_offset {
            if ctx_offset.num_samples() != n_samples || ctx_offset.total() != rows {
                return Err(PolicyError::MalformedBatch(format!(
                    "context_offset {:?} does not cover {rows} context rows for {n_samples} samples",
                    ctx_offset.as_slice()
                )));
            }
            let pooled = segment_mean(context.clone(), ctx_offset);
            return Ok(Some(pooled.select(0, self.batch.clone())));
        }

        if rows == self.num_points() {
            Ok(Some(context.clone()))
        } else if rows == n_samples {
            Ok(Some(context.clone().select(0, self.batch.clone())))
        } else {
            Err(PolicyError::MalformedBatch(format!(
                "context has {rows} rows; expected {} (per point) or {n_samples} (per sample)",
                self.num_points()
            )))
        }
    }
}

/// Per-point features returned by a backbone stage.
#[derive(Debug, Clone)]
pub struct PointFeatures<B: Backend> {
    pub feat: Tensor<B, 2>,
    pub offset: Offsets,
}

/// Elementwise max over each segment: `(N, C) -> (S, C)`.
pub fn segment_max<B: Backend>(x: Tensor<B, 2>, offsets: &Offsets) -> Tensor<B, 2> {
    let width = x.dims()[1];
    let pooled = offsets
        .spans()
        .map(|r| x.clone().slice([r, 0..width]).max_dim(0))
        .collect::<Vec<_>>();
    Tensor::cat(pooled, 0)
}

/// Mean over each segment: `(N, C) -> (S, C)`.
pub fn segment_mean<B: Backend>(x: Tensor<B, 2>, offsets: &Offsets) -> Tensor<B, 2> {
    let width = x.dims()[1];
    let pooled = offsets
        .spans()
        .map(|r| x.clone().slice([r, 0..width]).mean_dim(0))
        .collect::<Vec<_>>();
    Tensor::cat(pooled, 0)
}

/// Repeat every row `k` times in place: rows `[a, b]` become `[a, a, b, b]` for `k = 2`.
pub fn repeat_rows<B: Backend>(x: Tensor<B, 2>, k: usize) -> Tensor<B, 2> {
    if k == 1 {
        return x;
    }
    let [n, c] = x.dims();
    x.unsqueeze_dim::<3>(1).repeat_dim(1, k).reshape([n * k, c])
}
