//! Gaussian diffusion process
//!
//! Discrete-time DDPM noise schedule (optionally respaced), closed-form
//! forward noising, the model mean/variance computation, and the guidance
//! corrections the one-step samplers in [`sampler`] apply.
//!
//! All schedule tables are kept as `f64` on the host; tensors are combined
//! with them through scalar affine ops, so the process itself never owns
//! device memory.

pub mod respace;
pub mod sampler;

use candle_core::{DType, Device, Result, Tensor};
use tracing::debug;

use crate::config::{ConfigError, DiffusionConfig, NoiseSchedule};
use crate::network::{DenoisingNetwork, ModelKwargs};

pub use respace::{respaced_betas, space_timesteps};
pub use sampler::{OneStepSampler, PlmsHistory, StepContext, StepOutput};

/// The guidance callback slot of the one-step samplers.
///
/// Returns the gradient of the guidance objective with respect to `x` at
/// respaced step `t`; same shape as `x`. Implementations borrow `x` for the
/// duration of the call only.
pub trait Guidance {
    fn gradient(
        &self,
        diffusion: &GaussianDiffusion,
        x: &Tensor,
        t: usize,
        model_kwargs: &ModelKwargs,
    ) -> Result<Tensor>;
}

/// Model mean and variance at one step.
#[derive(Debug, Clone)]
pub struct MeanVariance {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

/// Base schedule betas for `num_timesteps` training steps.
pub fn named_beta_schedule(schedule: NoiseSchedule, num_timesteps: usize) -> Vec<f64> {
    match schedule {
        NoiseSchedule::Linear => {
            // Scale so the schedule matches the 1000-step original at any T.
            let scale = 1000.0 / num_timesteps as f64;
            let start = scale * 0.0001;
            let end = scale * 0.02;
            linspace(start, end, num_timesteps)
        }
        NoiseSchedule::Cosine => betas_for_alpha_bar(num_timesteps, 0.999, |t| {
            ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2)
                .cos()
                .powi(2)
        }),
    }
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => vec![],
        1 => vec![start],
        _ => {
            let denom = (steps - 1) as f64;
            (0..steps)
                .map(|i| start + (end - start) * i as f64 / denom)
                .collect()
        }
    }
}

/// Discretize a continuous `ᾱ(t)` on `[0, 1]` into betas.
fn betas_for_alpha_bar(n: usize, max_beta: f64, alpha_bar: impl Fn(f64) -> f64) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// Respaced Gaussian diffusion process.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    config: DiffusionConfig,
    /// Respaced index -> original training timestep.
    timestep_map: Vec<usize>,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl GaussianDiffusion {
    pub fn new(config: DiffusionConfig) -> std::result::Result<Self, ConfigError> {
        let base_betas = named_beta_schedule(config.noise_schedule, config.diffusion_steps);
        let base_alphas_cumprod = cumprod(&base_betas);
        let timestep_map = space_timesteps(config.diffusion_steps, &config.timestep_respacing)?;
        let betas = respaced_betas(&base_alphas_cumprod, &timestep_map);
        debug!(
            respacing = %config.timestep_respacing,
            base_steps = config.diffusion_steps,
            steps = betas.len(),
            "Built diffusion schedule"
        );
        Ok(Self::from_betas(config, timestep_map, betas))
    }

    fn from_betas(config: DiffusionConfig, timestep_map: Vec<usize>, betas: Vec<f64>) -> Self {
        let alphas_cumprod = cumprod(&betas);
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .take(betas.len())
            .collect();

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod
            .iter()
            .map(|a| (1.0 / a - 1.0).sqrt())
            .collect();

        let posterior_variance: Vec<f64> = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(alphas_cumprod_prev.iter()))
            .map(|(b, (a, a_prev))| b * (1.0 - a_prev) / (1.0 - a))
            .collect();
        // The posterior variance is 0 at the first step; clip its log there.
        let first_nonzero = posterior_variance
            .get(1)
            .copied()
            .unwrap_or_else(|| betas.first().copied().unwrap_or(1.0));
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .enumerate()
            .map(|(i, v)| if i == 0 { first_nonzero.ln() } else { v.ln() })
            .collect();
        let posterior_mean_coef1 = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(alphas_cumprod_prev.iter()))
            .map(|(b, (a, a_prev))| b * a_prev.sqrt() / (1.0 - a))
            .collect();
        let posterior_mean_coef2 = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(alphas_cumprod_prev.iter()))
            .map(|(b, (a, a_prev))| (1.0 - a_prev) * (1.0 - b).sqrt() / (1.0 - a))
            .collect();

        Self {
            config,
            timestep_map,
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        }
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    /// Number of respaced steps, the full length of a reverse run.
    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn timestep_map(&self) -> &[usize] {
        &self.timestep_map
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alpha_bar(&self, t: usize) -> f64 {
        self.alphas_cumprod[t]
    }

    pub fn alpha_bar_prev(&self, t: usize) -> f64 {
        self.alphas_cumprod_prev[t]
    }

    /// `√ᾱ_t`, the signal coefficient at step `t`.
    pub fn sqrt_alpha_bar(&self, t: usize) -> f64 {
        self.sqrt_alphas_cumprod[t]
    }

    /// `√(1 − ᾱ_t)`, the noise coefficient at step `t`.
    pub fn sqrt_one_minus_alpha_bar(&self, t: usize) -> f64 {
        self.sqrt_one_minus_alphas_cumprod[t]
    }

    fn check_step(&self, t: usize) -> Result<()> {
        if t >= self.num_timesteps() {
            candle_core::bail!(
                "timestep {t} out of range for a {}-step schedule",
                self.num_timesteps()
            );
        }
        Ok(())
    }

    /// Float timesteps `(B,)` the network sees at respaced step `t`.
    pub fn network_timesteps(&self, t: usize, batch: usize, device: &Device) -> Result<Tensor> {
        self.check_step(t)?;
        let original = self.timestep_map[t] as f64;
        let value = if self.config.rescale_timesteps {
            original * 1000.0 / self.config.diffusion_steps as f64
        } else {
            original
        };
        Tensor::full(value as f32, (batch,), device)
    }

    /// Forward-noise a clean image to step `t`:
    /// `√ᾱ_t·x₀ + √(1−ᾱ_t)·noise`.
    pub fn q_sample(&self, x_start: &Tensor, t: usize, noise: &Tensor) -> Result<Tensor> {
        self.check_step(t)?;
        if x_start.shape() != noise.shape() {
            candle_core::bail!(
                "noise shape {:?} does not match image shape {:?}",
                noise.dims(),
                x_start.dims()
            );
        }
        let noise = noise.to_dtype(x_start.dtype())?;
        (x_start * self.sqrt_alphas_cumprod[t])? + (noise * self.sqrt_one_minus_alphas_cumprod[t])?
    }

    /// Mean of `q(x_{t-1} | x_t, x₀)`.
    pub fn q_posterior_mean(&self, x_start: &Tensor, x_t: &Tensor, t: usize) -> Result<Tensor> {
        (x_start * self.posterior_mean_coef1[t])? + (x_t * self.posterior_mean_coef2[t])?
    }

    pub fn predict_xstart_from_eps(&self, x_t: &Tensor, t: usize, eps: &Tensor) -> Result<Tensor> {
        (x_t * self.sqrt_recip_alphas_cumprod[t])? - (eps * self.sqrt_recipm1_alphas_cumprod[t])?
    }

    pub fn predict_eps_from_xstart(
        &self,
        x_t: &Tensor,
        t: usize,
        pred_xstart: &Tensor,
    ) -> Result<Tensor> {
        ((x_t * self.sqrt_recip_alphas_cumprod[t])? - pred_xstart)?
            / self.sqrt_recipm1_alphas_cumprod[t]
    }

    /// Run the network at step `t` and derive the model's posterior.
    pub fn p_mean_variance(
        &self,
        network: &dyn DenoisingNetwork,
        x: &Tensor,
        t: usize,
        clip_denoised: bool,
        model_kwargs: &ModelKwargs,
    ) -> Result<MeanVariance> {
        self.check_step(t)?;
        let (b, c, _, _) = x.dims4()?;
        let timesteps = self.network_timesteps(t, b, x.device())?;
        let output = network
            .forward(x, &timesteps, model_kwargs)?
            .to_dtype(x.dtype())?;

        let (eps, log_variance) = if self.config.learn_sigma {
            let out_c = output.dim(1)?;
            if out_c != 2 * c {
                candle_core::bail!(
                    "network with learned sigma must return {} channels, got {out_c}",
                    2 * c
                );
            }
            let eps = output.narrow(1, 0, c)?;
            let var_values = output.narrow(1, c, c)?;
            // Interpolate between the posterior variance and beta in log space.
            let min_log = self.posterior_log_variance_clipped[t];
            let max_log = self.betas[t].ln();
            let frac = var_values.affine(0.5, 0.5)?;
            let log_variance = frac.affine(max_log - min_log, min_log)?;
            (eps, log_variance)
        } else {
            if output.dims() != x.dims() {
                candle_core::bail!(
                    "network output {:?} does not match input {:?}",
                    output.dims(),
                    x.dims()
                );
            }
            // Fixed large variance: beta_t, with the posterior variance at t = 0.
            let variance = if t == 0 {
                self.posterior_variance.get(1).copied().unwrap_or(self.betas[0])
            } else {
                self.betas[t]
            };
            let log_variance = Tensor::full(variance.ln() as f32, x.shape(), x.device())?
                .to_dtype(x.dtype())?;
            (output, log_variance)
        };

        let mut pred_xstart = self.predict_xstart_from_eps(x, t, &eps)?;
        if clip_denoised {
            pred_xstart = pred_xstart.clamp(-1f32, 1f32)?;
        }
        let mean = self.q_posterior_mean(&pred_xstart, x, t)?;
        let variance = log_variance.exp()?;
        Ok(MeanVariance {
            mean,
            variance,
            log_variance,
            pred_xstart,
        })
    }

    /// Shift the model mean along the guidance gradient scaled by the
    /// model variance.
    pub fn condition_mean(
        &self,
        guidance: &dyn Guidance,
        mv: &MeanVariance,
        x: &Tensor,
        t: usize,
        model_kwargs: &ModelKwargs,
    ) -> Result<Tensor> {
        let gradient = guidance.gradient(self, x, t, model_kwargs)?;
        let gradient = gradient.to_dtype(DType::F32)?;
        let mean = mv.mean.to_dtype(DType::F32)?;
        let variance = mv.variance.to_dtype(DType::F32)?;
        (mean + (variance * gradient)?)?.to_dtype(x.dtype())
    }

    /// Fold the guidance gradient into the score: `eps' = eps − √(1−ᾱ)·g`,
    /// then recompute `pred_xstart` and the mean from `eps'`.
    pub fn condition_score(
        &self,
        guidance: &dyn Guidance,
        mv: &MeanVariance,
        x: &Tensor,
        t: usize,
        model_kwargs: &ModelKwargs,
    ) -> Result<MeanVariance> {
        let gradient = guidance
            .gradient(self, x, t, model_kwargs)?
            .to_dtype(x.dtype())?;
        let eps = self.predict_eps_from_xstart(x, t, &mv.pred_xstart)?;
        let eps = (eps - (gradient * self.sqrt_one_minus_alphas_cumprod[t])?)?;
        let pred_xstart = self.predict_xstart_from_eps(x, t, &eps)?;
        let mean = self.q_posterior_mean(&pred_xstart, x, t)?;
        Ok(MeanVariance {
            mean,
            variance: mv.variance.clone(),
            log_variance: mv.log_variance.clone(),
            pred_xstart,
        })
    }
}

fn cumprod(betas: &[f64]) -> Vec<f64> {
    let mut acc = 1.0;
    betas
        .iter()
        .map(|b| {
            acc *= 1.0 - b;
            acc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diffusion(respacing: &str) -> GaussianDiffusion {
        GaussianDiffusion::new(DiffusionConfig {
            timestep_respacing: respacing.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_linear_schedule_endpoints() {
        let betas = named_beta_schedule(NoiseSchedule::Linear, 1000);
        assert_eq!(betas.len(), 1000);
        assert!((betas[0] - 1e-4).abs() < 1e-12);
        assert!((betas[999] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_schedule_bounded() {
        let betas = named_beta_schedule(NoiseSchedule::Cosine, 1000);
        assert!(betas.iter().all(|&b| b > 0.0 && b <= 0.999));
    }

    #[test]
    fn test_respaced_schedule_matches_base_alpha_bar() {
        let full = diffusion("1000");
        let spaced = diffusion("ddim50");
        assert_eq!(spaced.num_timesteps(), 50);
        for (i, &orig) in spaced.timestep_map().iter().enumerate() {
            let diff = (spaced.alpha_bar(i) - full.alpha_bar(orig)).abs();
            assert!(diff < 1e-9, "step {i}: {diff}");
        }
    }

    #[test]
    fn test_alpha_bar_decreasing() {
        let d = diffusion("100");
        assert!(d.alphas_cumprod().windows(2).all(|w| w[1] < w[0]));
        assert_eq!(d.alpha_bar_prev(0), 1.0);
    }

    #[test]
    fn test_network_timesteps_rescaled() -> Result<()> {
        let d = diffusion("ddim50");
        let ts = d.network_timesteps(1, 2, &Device::Cpu)?;
        assert_eq!(ts.to_vec1::<f32>()?, vec![20.0, 20.0]);
        assert!(d.network_timesteps(50, 1, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_xstart_eps_roundtrip() -> Result<()> {
        let d = diffusion("100");
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 4, 4), &device)?;
        let eps = Tensor::randn(0f32, 1.0, (1, 3, 4, 4), &device)?;
        let x0 = d.predict_xstart_from_eps(&x, 40, &eps)?;
        let eps_back = d.predict_eps_from_xstart(&x, 40, &x0)?;
        let diff = (eps - eps_back)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-3, "max diff {diff}");
        Ok(())
    }

    #[test]
    fn test_q_sample_shape_mismatch() -> Result<()> {
        let d = diffusion("100");
        let x = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let noise = Tensor::zeros((1, 3, 4, 2), DType::F32, &Device::Cpu)?;
        assert!(d.q_sample(&x, 10, &noise).is_err());
        Ok(())
    }
}
