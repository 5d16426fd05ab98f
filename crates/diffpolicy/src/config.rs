//! Policy configuration: closed mode enums and the TOML-backed config tree.
//!
//! Every string-valued mode of the model is a closed enum here, so unknown
//! values fail while the config is parsed and every later `match` is
//! exhaustive. [`PolicyConfig::validate`] checks the combinations the
//! diffusion policy can actually run before any module is built.
//!
//! # Example (TOML)
//!
//! ```toml
//! mini_batches = 4
//!
//! [action]
//! txt_ft_size = 512
//! rot_pred_type = "euler_disc"
//! euler_resolution = 5
//!
//! [diffusion]
//! total_timesteps = 100
//! beta_schedule = "scaled_linear"
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};

/// How multi-token text features are reduced before conditioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxtReduce {
    /// Keep every token; pose/step embeddings become extra tokens.
    #[serde(alias = "mean")]
    Concat,
    /// Softmax-weighted sum over each sample's tokens.
    Attn,
}

/// Pooling of per-point features into one vector per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduce {
    Max,
    Mean,
    Attn,
    MultiscaleMax,
    MultiscaleMaxLarge,
}

/// Position prediction family. The diffusion policy only runs `Diffuse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosPredType {
    HeatmapMlp,
    HeatmapMlp3,
    HeatmapMlpTopk,
    HeatmapMlpClf,
    HeatmapNormmax,
    HeatmapDisc,
    Diffuse,
}

/// Rotation parameterization predicted by the action head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotPredType {
    /// Unit quaternion (x, y, z, w).
    Quat,
    /// First two columns of the rotation matrix.
    Rot6d,
    /// Absolute euler angles divided by 180.
    Euler,
    /// Euler angles (/180) relative to the current end-effector pose.
    EulerDelta,
    /// One categorical distribution per euler axis.
    EulerDisc,
}

impl RotPredType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quat => "quat",
            Self::Rot6d => "rot6d",
            Self::Euler => "euler",
            Self::EulerDelta => "euler_delta",
            Self::EulerDisc => "euler_disc",
        }
    }

    /// Width of the rotation slice of the head output.
    pub fn raw_width(&self, euler_bins: usize) -> usize {
        match self {
            Self::Quat => 4,
            Self::Rot6d => 6,
            Self::Euler | Self::EulerDelta => 3,
            Self::EulerDisc => euler_bins * 3,
        }
    }

    /// Width of the rotation columns in `gt_actions`.
    ///
    /// `quat` and `rot6d` targets are quaternions; the euler variants carry
    /// three values (normalized angles or bin indices).
    pub fn target_width(&self) -> usize {
        match self {
            Self::Quat | Self::Rot6d => 4,
            Self::Euler | Self::EulerDelta | Self::EulerDisc => 3,
        }
    }
}

impl fmt::Display for RotPredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position loss metric over predicted vs. injected noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosMetric {
    L2,
    L1,
}

/// Shape of the DDPM variance schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation of beta.
    Linear,
    /// Linear interpolation of sqrt(beta).
    ScaledLinear,
    /// Glide cosine schedule.
    SquaredcosCapV2,
}

/// What the denoise head is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    Sample,
}

/// Top-level policy configuration (everything but the training loop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Noise replicas drawn per ground-truth sample during training.
    #[serde(default = "default_mini_batches")]
    pub mini_batches: usize,
    #[serde(default)]
    pub action: ActionConfig,
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub backbone: BackboneConfig,
}

/// Context and action-head settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    /// Width of the incoming text-token embeddings.
    #[serde(default = "default_txt_ft_size")]
    pub txt_ft_size: usize,
    /// Width of every context vector (text, pose, step, timestep).
    #[serde(default = "default_context_channels")]
    pub context_channels: usize,
    #[serde(default = "default_txt_reduce")]
    pub txt_reduce: TxtReduce,
    #[serde(default = "default_true")]
    pub use_ee_pose: bool,
    #[serde(default)]
    pub use_step_id: bool,
    /// Size of the step-id embedding table.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_reduce")]
    pub reduce: Reduce,
    #[serde(default = "default_pos_pred_type")]
    pub pos_pred_type: PosPredType,
    #[serde(default = "default_rot_pred_type")]
    pub rot_pred_type: RotPredType,
    #[serde(default)]
    pub dropout: f64,
    /// Grid size handed to voxelizing backbones.
    #[serde(default = "default_voxel_size")]
    pub voxel_size: f64,
    /// Degrees per euler bin for `euler_disc`.
    #[serde(default = "default_euler_resolution")]
    pub euler_resolution: usize,
}

/// Noise scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of training timesteps of the forward process.
    #[serde(default = "default_total_timesteps")]
    pub total_timesteps: usize,
    /// Reverse steps at inference. Defaults to `total_timesteps`.
    #[serde(default)]
    pub inference_steps: Option<usize>,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,
    #[serde(default = "default_prediction_type")]
    pub prediction_type: PredictionType,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    /// Clamp the predicted clean sample to `[-clip_sample_range, clip_sample_range]`.
    #[serde(default = "default_true")]
    pub clip_sample: bool,
    #[serde(default = "default_clip_sample_range")]
    pub clip_sample_range: f64,
}

/// Loss weighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_weight")]
    pub pos_weight: f64,
    #[serde(default = "default_weight")]
    pub rot_weight: f64,
    #[serde(default = "default_pos_metric")]
    pub pos_metric: PosMetric,
}

/// Reference point backbone settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Per-point feature width `F` (first three columns are xyz).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// Hidden widths of the per-point encoder.
    #[serde(default = "default_enc_channels")]
    pub enc_channels: Vec<usize>,
    /// Output width of the last decoder layer; the action head's hidden size.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

fn default_mini_batches() -> usize {
    1
}
fn default_txt_ft_size() -> usize {
    512
}
fn default_context_channels() -> usize {
    256
}
fn default_txt_reduce() -> TxtReduce {
    TxtReduce::Attn
}
fn default_true() -> bool {
    true
}
fn default_max_steps() -> usize {
    30
}
fn default_reduce() -> Reduce {
    Reduce::Max
}
fn default_pos_pred_type() -> PosPredType {
    PosPredType::Diffuse
}
fn default_rot_pred_type() -> RotPredType {
    RotPredType::Quat
}
fn default_voxel_size() -> f64 {
    0.01
}
fn default_euler_resolution() -> usize {
    5
}
fn default_total_timesteps() -> usize {
    100
}
fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::ScaledLinear
}
fn default_prediction_type() -> PredictionType {
    PredictionType::Epsilon
}
fn default_beta_start() -> f64 {
    1e-4
}
fn default_beta_end() -> f64 {
    0.02
}
fn default_clip_sample_range() -> f64 {
    1.0
}
fn default_weight() -> f64 {
    1.0
}
fn default_pos_metric() -> PosMetric {
    PosMetric::L2
}
fn default_in_channels() -> usize {
    6
}
fn default_enc_channels() -> Vec<usize> {
    vec![64, 128]
}
fn default_hidden_size() -> usize {
    128
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mini_batches: default_mini_batches(),
            action: ActionConfig::default(),
            diffusion: DiffusionConfig::default(),
            loss: LossConfig::default(),
            backbone: BackboneConfig::default(),
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            txt_ft_size: default_txt_ft_size(),
            context_channels: default_context_channels(),
            txt_reduce: default_txt_reduce(),
            use_ee_pose: true,
            use_step_id: false,
            max_steps: default_max_steps(),
            reduce: default_reduce(),
            pos_pred_type: default_pos_pred_type(),
            rot_pred_type: default_rot_pred_type(),
            dropout: 0.0,
            voxel_size: default_voxel_size(),
            euler_resolution: default_euler_resolution(),
        }
    }
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            total_timesteps: default_total_timesteps(),
            inference_steps: None,
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            clip_sample: true,
            clip_sample_range: default_clip_sample_range(),
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            pos_weight: default_weight(),
            rot_weight: default_weight(),
            pos_metric: default_pos_metric(),
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            enc_channels: default_enc_channels(),
            hidden_size: default_hidden_size(),
        }
    }
}

impl ActionConfig {
    /// Number of categories per euler axis.
    pub fn euler_bins(&self) -> usize {
        360 / self.euler_resolution.max(1)
    }
}

impl DiffusionConfig {
    /// Reverse steps walked by the inference loop.
    pub fn num_inference_steps(&self) -> usize {
        self.inference_steps.unwrap_or(self.total_timesteps)
    }
}

impl PolicyConfig {
    /// Parse a config from TOML text. Does not validate.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PolicyError::InvalidConfig(e.to_string()))
    }

    /// Reject combinations the diffusion policy cannot run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PolicyError::InvalidConfig(msg));
        let act = &self.action;

        if self.mini_batches == 0 {
            return invalid("mini_batches must be >= 1".into());
        }
        if act.pos_pred_type != PosPredType::Diffuse {
            return invalid(format!(
                "pos_pred_type {:?} is not supported by the diffusion policy",
                act.pos_pred_type
            ));
        }
        if act.txt_reduce != TxtReduce::Attn {
            return Err(PolicyError::TxtReduceRequired);
        }
        if act.context_channels == 0 || act.context_channels % 2 != 0 {
            return invalid(format!(
                "context_channels must be even and > 0, got {}",
                act.context_channels
            ));
        }
        if act.txt_ft_size == 0 {
            return invalid("txt_ft_size must be > 0".into());
        }
        if act.euler_resolution == 0 || 360 % act.euler_resolution != 0 {
            return invalid(format!(
                "euler_resolution must divide 360, got {}",
                act.euler_resolution
            ));
        }
        if act.rot_pred_type == RotPredType::EulerDelta && !act.use_ee_pose {
            return invalid("euler_delta needs use_ee_pose = true".into());
        }
        if act.use_step_id && act.max_steps == 0 {
            return invalid("max_steps must be > 0 when use_step_id is set".into());
        }
        if !(0.0..1.0).contains(&act.dropout) {
            return invalid(format!("dropout must be in [0, 1), got {}", act.dropout));
        }

        let diff = &self.diffusion;
        if diff.total_timesteps == 0 {
            return invalid("total_timesteps must be > 0".into());
        }
        let steps = diff.num_inference_steps();
        if steps == 0 || steps > diff.total_timesteps {
            return invalid(format!(
                "inference_steps must be in 1..={}, got {steps}",
                diff.total_timesteps
            ));
        }
        if !(diff.beta_start > 0.0 && diff.beta_start < diff.beta_end && diff.beta_end < 1.0) {
            return invalid(format!(
                "beta range must satisfy 0 < beta_start < beta_end < 1, got [{}, {}]",
                diff.beta_start, diff.beta_end
            ));
        }

        if self.backbone.in_channels < 3 {
            return invalid("backbone.in_channels must be >= 3 (xyz first)".into());
        }
        if self.backbone.hidden_size == 0 || self.backbone.enc_channels.iter().any(|&c| c == 0) {
            return invalid("backbone widths must be > 0".into());
        }
        Ok(())
    }
}
