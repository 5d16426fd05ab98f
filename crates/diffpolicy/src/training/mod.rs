//! Policy training pipeline: synthetic batch sampling, loss functions and
//! the AdamW training loop with checkpointing.

pub mod data;
pub mod loss;
pub mod trainer;
