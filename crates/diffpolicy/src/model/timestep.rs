use burn::prelude::*;

/// Truncated `ln(1e-4)`.
pub const LOG_10000: f64 = -9.2103;

/// Sinusoidal embedding of scalar diffusion steps.
///
/// ```text
/// half  = dim / 2
/// freq  = exp(LOG_10000 * i / half),  i in 0..half
/// embed = [sin(t * freq), cos(t * freq)]
/// ```
///
/// Parameter-free; `embed(0)` is `half` zeros followed by `half` ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinusoidalTimestepEmbedding {
    dim: usize,
}

impl SinusoidalTimestepEmbedding {
    pub fn new(dim: usize) -> Self {
        assert!(dim >= 2 && dim % 2 == 0, "timestep embedding dim must be even, got {dim}");
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `(len,)` steps to `(len, dim)` embeddings.
    pub fn embed<B: Backend>(&self, steps: Tensor<B, 1>) -> Tensor<B, 2> {
        let device = steps.device();
        let half = self.dim / 2;
        let freqs: Vec<f32> = (0..half)
            .map(|i| (LOG_10000 * i as f64 / half as f64).exp() as f32)
            .collect();
        let freqs = Tensor::<B, 1>::from_floats(freqs.as_slice(), &device).unsqueeze_dim::<2>(0);

        let args = steps.unsqueeze_dim::<2>(1) * freqs;
        Tensor::cat(vec![args.clone().sin(), args.cos()], 1)
    }

    /// Embed host-side integer steps.
    pub fn embed_steps<B: Backend>(&self, steps: &[usize], device: &B::Device) -> Tensor<B, 2> {
        let steps: Vec<f32> = steps.iter().map(|&s| s as f32).collect();
        self.embed(Tensor::<B, 1>::from_floats(steps.as_slice(), device))
    }
}
