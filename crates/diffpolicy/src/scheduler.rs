//! Noise scheduling for the position diffusion.
//!
//! [`DdpmScheduler`] follows the DDPM formulation used by the `diffusers`
//! library: leading timestep spacing, fixed-small variance, optional clipping
//! of the predicted clean sample.

use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};

use crate::config::{BetaSchedule, DiffusionConfig, PredictionType};
use crate::error::{PolicyError, Result};

/// Forward-noising and reverse-stepping of a diffusion process over `(N, C)`
/// samples.
pub trait NoiseScheduler {
    fn num_train_timesteps(&self) -> usize;

    /// Choose the reverse schedule for `num_inference_steps` steps.
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

    /// Reverse timesteps in descending order, as set by `set_timesteps`.
    fn timesteps(&self) -> &[usize];

    /// Noise `original` to timestep `timesteps[i]` per row `i`.
    fn add_noise<B: Backend>(
        &self,
        original: Tensor<B, 2>,
        noise: Tensor<B, 2>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 2>>;

    /// One reverse step from `timestep` for every row of `sample`.
    fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 2>,
        timestep: usize,
        sample: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>>;
}

#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    prediction_type: PredictionType,
    clip_sample: Option<f64>,
    num_inference_steps: usize,
    timesteps: Vec<usize>,
}

impl DdpmScheduler {
    /// Build the schedule and set the reverse timesteps to every training
    /// step (or `inference_steps` when configured).
    pub fn new(config: &DiffusionConfig) -> Result<Self> {
        let t = config.total_timesteps;
        if t == 0 {
            return Err(PolicyError::InvalidConfig("total_timesteps must be > 0".into()));
        }
        let betas = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, t),
            BetaSchedule::ScaledLinear => linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), t)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaSchedule::SquaredcosCapV2 => squaredcos_cap_v2(t),
        };
        let alphas_cumprod = betas
            .iter()
            .scan(1.0, |acc, b| {
                *acc *= 1.0 - b;
                Some(*acc)
            })
            .collect();

        let mut scheduler = Self {
            betas,
            alphas_cumprod,
            prediction_type: config.prediction_type,
            clip_sample: config.clip_sample.then_some(config.clip_sample_range),
            num_inference_steps: t,
            timesteps: Vec::new(),
        };
        scheduler.set_timesteps(config.num_inference_steps())?;
        Ok(scheduler)
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn alpha_cumprod(&self, t: usize) -> Result<f64> {
        self.alphas_cumprod.get(t).copied().ok_or_else(|| {
            PolicyError::MalformedBatch(format!(
                "timestep {t} outside [0, {})",
                self.alphas_cumprod.len()
            ))
        })
    }

    fn previous_timestep(&self, t: usize) -> Option<usize> {
        let ratio = self.num_train_timesteps() / self.num_inference_steps;
        t.checked_sub(ratio)
    }
}

impl NoiseScheduler for DdpmScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let t = self.num_train_timesteps();
        if num_inference_steps == 0 || num_inference_steps > t {
            return Err(PolicyError::InvalidConfig(format!(
                "num_inference_steps must be in 1..={t}, got {num_inference_steps}"
            )));
        }
        let ratio = t / num_inference_steps;
        self.num_inference_steps = num_inference_steps;
        self.timesteps = (0..num_inference_steps).rev().map(|i| i * ratio).collect();
        Ok(())
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn add_noise<B: Backend>(
        &self,
        original: Tensor<B, 2>,
        noise: Tensor<B, 2>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 2>> {
        let [rows, _] = original.dims();
        if timesteps.len() != rows || noise.dims() != original.dims() {
            return Err(PolicyError::MalformedBatch(format!(
                "add_noise got {} timesteps and noise {:?} for samples {:?}",
                timesteps.len(),
                noise.dims(),
                original.dims()
            )));
        }
        let device = original.device();
        let mut signal = Vec::with_capacity(rows);
        let mut sigma = Vec::with_capacity(rows);
        for &t in timesteps {
            let ac = self.alpha_cumprod(t)?;
            signal.push(ac.sqrt() as f32);
            sigma.push((1.0 - ac).sqrt() as f32);
        }
        let signal = Tensor::<B, 2>::from_data(TensorData::new(signal, [rows, 1]), &device);
        let sigma = Tensor::<B, 2>::from_data(TensorData::new(sigma, [rows, 1]), &device);
        Ok(original * signal + noise * sigma)
    }

    fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 2>,
        timestep: usize,
        sample: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let ac_t = self.alpha_cumprod(timestep)?;
        let ac_prev = match self.previous_timestep(timestep) {
            Some(prev) => self.alpha_cumprod(prev)?,
            None => 1.0,
        };
        let beta_prod_t = 1.0 - ac_t;
        let beta_prod_prev = 1.0 - ac_prev;
        let current_alpha_t = ac_t / ac_prev;
        let current_beta_t = 1.0 - current_alpha_t;

        let mut pred_original = match self.prediction_type {
            PredictionType::Epsilon => {
                (sample.clone() - model_output * beta_prod_t.sqrt()).div_scalar(ac_t.sqrt())
            }
            PredictionType::Sample => model_output,
        };
        if let Some(range) = self.clip_sample {
            pred_original = pred_original.clamp(-range, range);
        }

        let original_coeff = ac_prev.sqrt() * current_beta_t / beta_prod_t;
        let current_coeff = current_alpha_t.sqrt() * beta_prod_prev / beta_prod_t;
        let mut prev_sample = pred_original * original_coeff + sample.clone() * current_coeff;

        if timestep > 0 {
            let variance = (beta_prod_prev / beta_prod_t * current_beta_t).max(1e-20);
            let noise = Tensor::<B, 2>::random(
                sample.dims(),
                Distribution::Normal(0.0, 1.0),
                &sample.device(),
            );
            prev_sample = prev_sample + noise * variance.sqrt();
        }
        Ok(prev_sample)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

fn squaredcos_cap_v2(n: usize) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn scheduler(total: usize) -> DdpmScheduler {
        DdpmScheduler::new(&DiffusionConfig {
            total_timesteps: total,
            ..DiffusionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_scaled_linear_endpoints() {
        let s = scheduler(100);
        let betas = s.betas();
        assert_eq!(betas.len(), 100);
        assert!((betas[0] - 1e-4).abs() < 1e-10);
        assert!((betas[99] - 0.02).abs() < 1e-10);
        // sqrt(beta) is linear.
        let d0 = betas[1].sqrt() - betas[0].sqrt();
        let d1 = betas[51].sqrt() - betas[50].sqrt();
        assert!((d0 - d1).abs() < 1e-10);
    }

    #[test]
    fn test_alphas_cumprod_decreasing() {
        for schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear, BetaSchedule::SquaredcosCapV2] {
            let s = DdpmScheduler::new(&DiffusionConfig {
                beta_schedule: schedule,
                ..DiffusionConfig::default()
            })
            .unwrap();
            let ac = s.alphas_cumprod();
            assert!(ac.windows(2).all(|w| w[1] < w[0]), "{schedule:?} not decreasing");
            assert!(ac[0] < 1.0 && *ac.last().unwrap() > 0.0);
        }
    }

    #[test]
    fn test_leading_timesteps() {
        let mut s = scheduler(100);
        assert_eq!(s.timesteps().len(), 100);
        assert_eq!(s.timesteps()[0], 99);
        assert_eq!(*s.timesteps().last().unwrap(), 0);

        s.set_timesteps(10).unwrap();
        assert_eq!(s.timesteps(), &[90, 80, 70, 60, 50, 40, 30, 20, 10, 0]);

        assert!(s.set_timesteps(0).is_err());
        assert!(s.set_timesteps(101).is_err());
    }

    #[test]
    fn test_add_noise_mixes_per_row() {
        let device = Default::default();
        let s = scheduler(100);
        let x = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let eps = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        let noisy = s.add_noise(x, eps, &[0, 99]).unwrap();
        let values: Vec<f32> = noisy.into_data().to_vec().unwrap();
        let ac = s.alphas_cumprod();
        assert!((values[0] - ac[0].sqrt() as f32).abs() < 1e-6);
        assert!((values[3] - ac[99].sqrt() as f32).abs() < 1e-6);

        let x = Tensor::<TestBackend, 2>::ones([1, 3], &device);
        let eps = Tensor::<TestBackend, 2>::zeros([1, 3], &device);
        assert!(s.add_noise(x, eps, &[100]).is_err());
    }

    #[test]
    fn test_final_step_recovers_clean_sample() {
        let device = Default::default();
        let s = scheduler(100);
        let x0 = Tensor::<TestBackend, 2>::from_floats([[0.3, -0.2, 0.5]], &device);
        let eps = Tensor::<TestBackend, 2>::from_floats([[1.0, -0.5, 0.25]], &device);
        let xt = s.add_noise(x0.clone(), eps.clone(), &[0]).unwrap();

        // At t = 0 the step is deterministic and returns the predicted x0.
        let prev = s.step(eps, 0, xt).unwrap();
        let diff: f32 = (prev - x0).abs().max().into_scalar().elem();
        assert!(diff < 1e-5, "diff={diff}");
    }

    #[test]
    fn test_sample_prediction_is_clipped() {
        let device = Default::default();
        let s = DdpmScheduler::new(&DiffusionConfig {
            prediction_type: PredictionType::Sample,
            ..DiffusionConfig::default()
        })
        .unwrap();
        let out = Tensor::<TestBackend, 2>::from_floats([[5.0, -5.0, 0.5]], &device);
        let sample = Tensor::<TestBackend, 2>::zeros([1, 3], &device);
        let prev: Vec<f32> = s.step(out, 0, sample).unwrap().into_data().to_vec().unwrap();
        assert_eq!(prev, vec![1.0, -1.0, 0.5]);
    }
}
