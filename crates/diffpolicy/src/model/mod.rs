//! Policy model components: context assembly, action head, timestep
//! embedding, the point backbone interface, and the tensor bridge to host
//! rows.

pub mod action_head;
pub mod backbone;
pub mod bridge;
pub mod context;
pub mod timestep;

pub use action_head::{ActionHead, ActionHeadConfig};
pub use backbone::{PointBackbone, PointMlpBackbone, PointMlpBackboneConfig, PointMlpCache};
pub use context::{ContextAssembler, ContextAssemblerConfig, PoseEmbedding};
pub use timestep::SinusoidalTimestepEmbedding;
