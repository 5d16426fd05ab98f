//! Rotation parameterizations: host math and the per-parameterization codec.

pub mod codec;
pub mod math;

pub use codec::{RotationCodec, RotationOutput};
