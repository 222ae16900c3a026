//! Gradient guidance
//!
//! The guidance strategy turns a set of objectives into the gradient the
//! samplers fold into their mean or score. At every step it forms a
//! denoised estimate of the noisy image, blends it back toward the noisy
//! image by the step's noise level, scores the blend with every objective
//! and differentiates the summed loss with respect to the noisy image.
//!
//! Two estimators exist: [`GuidanceStrategy::Fast`] asks the secondary
//! denoiser, [`GuidanceStrategy::Full`] runs the main network.

use std::sync::Arc;

use candle_core::{D, DType, Result, Tensor, Var};
use tracing::debug;

use crate::diffusion::{GaussianDiffusion, Guidance};
use crate::network::{DenoisingNetwork, ModelKwargs};
use crate::schedule::alpha_sigma_to_t;
use crate::secondary::SecondaryDenoiser;

/// A guidance goal registered once per run.
#[derive(Debug, Clone)]
pub enum ConditioningTarget {
    Text { prompt: String, weight: f64 },
    /// Precomputed embedding `(D,)` or `(1, D)`.
    Embedding { embedding: Tensor, weight: f64 },
    /// Target image `(1, C, H, W)` or `(B, C, H, W)`.
    Image { image: Tensor, weight: f64 },
}

impl ConditioningTarget {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self::Text {
            prompt: prompt.into(),
            weight: 1.0,
        }
    }

    pub fn image(image: Tensor) -> Self {
        Self::Image { image, weight: 1.0 }
    }

    pub fn embedding(embedding: Tensor) -> Self {
        Self::Embedding {
            embedding,
            weight: 1.0,
        }
    }

    pub fn with_weight(self, weight: f64) -> Self {
        match self {
            Self::Text { prompt, .. } => Self::Text { prompt, weight },
            Self::Embedding { embedding, .. } => Self::Embedding { embedding, weight },
            Self::Image { image, .. } => Self::Image { image, weight },
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::Text { weight, .. } | Self::Embedding { weight, .. } | Self::Image { weight, .. } => {
                *weight
            }
        }
    }
}

/// A differentiable scoring function of the blended denoised image.
pub trait GuidanceObjective {
    /// Replace the goals this objective scores against.
    fn set_targets(&mut self, targets: &[ConditioningTarget]) -> Result<()>;

    /// Scalar loss of `x_in: (B, C, H, W)` at respaced step `t`. Must stay
    /// on the autograd graph of `x_in`.
    fn loss(&self, x_in: &Tensor, t: usize) -> Result<Tensor>;
}

/// Weighted mean squared error to target images.
#[derive(Debug, Default)]
pub struct ImageDistanceObjective {
    targets: Vec<(Tensor, f64)>,
}

impl ImageDistanceObjective {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }
}

impl GuidanceObjective for ImageDistanceObjective {
    fn set_targets(&mut self, targets: &[ConditioningTarget]) -> Result<()> {
        self.targets = targets
            .iter()
            .filter_map(|target| match target {
                ConditioningTarget::Image { image, weight } => Some((image.detach(), *weight)),
                _ => None,
            })
            .collect();
        Ok(())
    }

    fn loss(&self, x_in: &Tensor, _t: usize) -> Result<Tensor> {
        let mut total = Tensor::zeros((), x_in.dtype(), x_in.device())?;
        for (image, weight) in &self.targets {
            let image = image.to_dtype(x_in.dtype())?;
            let mse = x_in.broadcast_sub(&image)?.sqr()?.mean_all()?;
            total = (total + (mse * *weight)?)?;
        }
        Ok(total)
    }
}

/// Embeds images (and optionally text) into a shared space, e.g. CLIP.
pub trait ImageEncoder {
    /// `(B, C, H, W) -> (B, D)`; must be differentiable in its input.
    fn encode_image(&self, images: &Tensor) -> Result<Tensor>;

    fn encode_text(&self, prompt: &str) -> Result<Tensor> {
        candle_core::bail!("image encoder cannot embed text prompt {prompt:?}")
    }
}

/// Weighted squared great-circle distance between normalized embeddings,
/// `2·asin(|x − y| / 2)²`.
pub struct SphericalDistanceObjective {
    encoder: Arc<dyn ImageEncoder>,
    targets: Vec<(Tensor, f64)>,
}

impl SphericalDistanceObjective {
    pub fn new(encoder: Arc<dyn ImageEncoder>) -> Self {
        Self {
            encoder,
            targets: Vec::new(),
        }
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }
}

impl GuidanceObjective for SphericalDistanceObjective {
    fn set_targets(&mut self, targets: &[ConditioningTarget]) -> Result<()> {
        let mut embedded = Vec::with_capacity(targets.len());
        for target in targets {
            let embedding = match target {
                ConditioningTarget::Text { prompt, .. } => self.encoder.encode_text(prompt)?,
                ConditioningTarget::Embedding { embedding, .. } => embedding.clone(),
                ConditioningTarget::Image { image, .. } => self.encoder.encode_image(image)?,
            };
            let embedding = match embedding.rank() {
                1 => embedding.unsqueeze(0)?,
                _ => embedding,
            };
            embedded.push((normalize(&embedding.detach())?, target.weight()));
        }
        self.targets = embedded;
        Ok(())
    }

    fn loss(&self, x_in: &Tensor, _t: usize) -> Result<Tensor> {
        let embed = normalize(&self.encoder.encode_image(x_in)?)?;
        let mut total = Tensor::zeros((), embed.dtype(), embed.device())?;
        for (target, weight) in &self.targets {
            let target = target.to_dtype(embed.dtype())?;
            let dist = spherical_distance(&embed, &target)?.mean_all()?;
            total = (total + (dist * *weight)?)?;
        }
        Ok(total)
    }
}

fn normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    x.broadcast_div(&(norm + 1e-12)?)
}

/// `2·asin(|x − y| / 2)²` row-wise for unit vectors.
pub fn spherical_distance(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let chord = (x.broadcast_sub(y)?.sqr()?.sum(D::Minus1)? + 1e-12)?.sqrt()?;
    let half = (chord / 2.0)?.clamp(0f32, 1f32)?;
    asin(&half)?.sqr()? * 2.0
}

/// Differentiable `asin` on `[0, 1]` (Abramowitz & Stegun 4.4.45,
/// absolute error below 7e-5).
fn asin(x: &Tensor) -> Result<Tensor> {
    const A: [f64; 4] = [1.570_728_8, -0.212_114_4, 0.074_261_0, -0.018_729_3];
    let poly = ((((x * A[3])? + A[2])? * x)? + A[1])?;
    let poly = ((poly * x)? + A[0])?;
    let root = x.affine(-1.0, 1.0)?.clamp(0f32, 1f32)?.sqrt()?;
    (root * poly)?.affine(-1.0, std::f64::consts::FRAC_PI_2)
}

/// Source of the denoised estimate the objectives score.
#[derive(Clone)]
pub enum GuidanceStrategy {
    /// Secondary denoiser at the continuous time matching the step.
    Fast { secondary: Arc<SecondaryDenoiser> },
    /// The main network's `pred_xstart`.
    Full { network: Arc<dyn DenoisingNetwork> },
}

impl GuidanceStrategy {
    pub fn is_fast(&self) -> bool {
        matches!(self, Self::Fast { .. })
    }
}

/// Objectives bound to an estimator.
pub struct GradientGuidance {
    strategy: GuidanceStrategy,
    objectives: Vec<Box<dyn GuidanceObjective>>,
}

impl GradientGuidance {
    pub fn new(strategy: GuidanceStrategy, objectives: Vec<Box<dyn GuidanceObjective>>) -> Self {
        Self {
            strategy,
            objectives,
        }
    }

    pub fn strategy(&self) -> &GuidanceStrategy {
        &self.strategy
    }

    pub fn num_objectives(&self) -> usize {
        self.objectives.len()
    }

    /// Register the run's targets with every objective.
    pub fn set_targets(&mut self, targets: &[ConditioningTarget]) -> Result<()> {
        for objective in &mut self.objectives {
            objective.set_targets(targets)?;
        }
        Ok(())
    }

    fn denoised_estimate(
        &self,
        diffusion: &GaussianDiffusion,
        x: &Tensor,
        t: usize,
        model_kwargs: &ModelKwargs,
    ) -> Result<Tensor> {
        match &self.strategy {
            GuidanceStrategy::Fast { secondary } => {
                let alpha = diffusion.sqrt_alpha_bar(t);
                let sigma = diffusion.sqrt_one_minus_alpha_bar(t);
                let cosine_t = alpha_sigma_to_t(alpha, sigma);
                let batch = x.dim(0)?;
                let times = Tensor::full(cosine_t as f32, (batch,), x.device())?;
                let out = secondary.forward(&x.to_dtype(DType::F32)?, &times)?;
                out.pred().to_dtype(x.dtype())
            }
            GuidanceStrategy::Full { network } => {
                let out = diffusion.p_mean_variance(network.as_ref(), x, t, false, model_kwargs)?;
                Ok(out.pred_xstart)
            }
        }
    }
}

impl Guidance for GradientGuidance {
    fn gradient(
        &self,
        diffusion: &GaussianDiffusion,
        x: &Tensor,
        t: usize,
        model_kwargs: &ModelKwargs,
    ) -> Result<Tensor> {
        if self.objectives.is_empty() {
            return x.zeros_like();
        }
        let var = Var::from_tensor(&x.detach())?;
        let x_var = var.as_tensor();

        let pred = self.denoised_estimate(diffusion, x_var, t, model_kwargs)?;
        let fac = diffusion.sqrt_one_minus_alpha_bar(t);
        let x_in = ((pred * fac)? + (x_var * (1.0 - fac))?)?;

        let mut total: Option<Tensor> = None;
        for objective in &self.objectives {
            let loss = objective.loss(&x_in, t)?.sum_all()?.to_dtype(DType::F32)?;
            total = Some(match total {
                Some(acc) => (acc + loss)?,
                None => loss,
            });
        }
        let Some(total) = total else {
            return x.zeros_like();
        };
        let loss_value = total.to_scalar::<f32>()?;
        debug!(t, loss = loss_value, "guidance loss");

        let grads = total.backward()?;
        match grads.get(x_var) {
            Some(grad) => grad.neg()?.detach().to_dtype(x.dtype()),
            None => x.zeros_like(),
        }
    }
}
