//! Diffusion point-cloud policy for robot manipulation.
//!
//! Predicts an end-effector action (position, unit quaternion, gripper
//! openness logit) from a ragged batch of point clouds and a text
//! instruction. Position is recovered by iterative DDPM denoising of anchor
//! points through a point backbone; rotation and openness are regressed from
//! the backbone's point features conditioned on the denoised position.

pub mod batch;
pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod policy;
pub mod rotation;
pub mod scheduler;
pub mod training;

pub use batch::{ObservationBatch, Offsets, PointBatch, PointFeatures};
pub use config::PolicyConfig;
pub use error::{PolicyError, Result};
pub use inference::{InferenceMode, ACTION_WIDTH, DATASET_ACTION_WIDTH};
pub use policy::{DiffusionPolicy, ParamReport, PolicyNet};
pub use rotation::RotationCodec;
pub use scheduler::{DdpmScheduler, NoiseScheduler};
