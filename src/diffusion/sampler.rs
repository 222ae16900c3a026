//! One-step reverse samplers
//!
//! Each sampler maps `x_t` at respaced step `t` to `x_{t-1}`, optionally
//! steering with a [`Guidance`] callback. Ancestral and DDIM steps are
//! Markovian; PLMS carries a bounded history of previous eps predictions
//! that the caller threads from one step to the next.

use std::collections::VecDeque;

use candle_core::{Result, Tensor};
use tracing::trace;

use super::{GaussianDiffusion, Guidance, MeanVariance};
use crate::config::{ConfigError, SamplerKind};
use crate::network::{DenoisingNetwork, ModelKwargs};
use crate::utils::Pcg32;

/// Borrowed collaborators of one sampler invocation.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub network: &'a dyn DenoisingNetwork,
    pub guidance: Option<&'a dyn Guidance>,
    pub model_kwargs: &'a ModelKwargs,
    pub clip_denoised: bool,
}

/// Previous eps predictions of a PLMS run, oldest first.
#[derive(Debug, Clone, Default)]
pub struct PlmsHistory {
    eps: VecDeque<Tensor>,
}

impl PlmsHistory {
    pub fn len(&self) -> usize {
        self.eps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.eps.iter()
    }
}

/// Result of one sampler step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `x_{t-1}`.
    pub sample: Tensor,
    /// Denoised estimate of the model before guidance.
    pub pred_xstart: Tensor,
    /// Eps history for the next PLMS step; `None` for Markovian samplers.
    pub history: Option<PlmsHistory>,
}

/// The one-step sampling algorithms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OneStepSampler {
    Ancestral,
    Ddim { eta: f64 },
    Plms { order: usize },
}

impl OneStepSampler {
    pub fn new(kind: SamplerKind, ddim_eta: f64, plms_order: usize) -> std::result::Result<Self, ConfigError> {
        match kind {
            SamplerKind::Ancestral => Ok(Self::Ancestral),
            SamplerKind::Ddim => Ok(Self::Ddim { eta: ddim_eta }),
            SamplerKind::Plms => {
                if !(1..=4).contains(&plms_order) {
                    return Err(ConfigError::InvalidPlmsOrder(plms_order));
                }
                Ok(Self::Plms { order: plms_order })
            }
        }
    }

    pub fn kind(&self) -> SamplerKind {
        match self {
            Self::Ancestral => SamplerKind::Ancestral,
            Self::Ddim { .. } => SamplerKind::Ddim,
            Self::Plms { .. } => SamplerKind::Plms,
        }
    }

    /// Whether the caller must thread the previous [`StepOutput`] back in.
    pub fn needs_history(&self) -> bool {
        matches!(self, Self::Plms { .. })
    }

    /// Advance `x` from respaced step `t` to `t - 1`.
    ///
    /// `previous` is only read by PLMS; other samplers ignore it.
    pub fn step(
        &self,
        diffusion: &GaussianDiffusion,
        ctx: &StepContext<'_>,
        x: &Tensor,
        t: usize,
        previous: Option<&StepOutput>,
        rng: &mut Pcg32,
    ) -> Result<StepOutput> {
        trace!(sampler = %self.kind(), t, "sampler step");
        let out = match *self {
            Self::Ancestral => p_sample(diffusion, ctx, x, t, rng)?,
            Self::Ddim { eta } => ddim_sample(diffusion, ctx, x, t, eta, rng)?,
            Self::Plms { order } => {
                let history = previous.and_then(|p| p.history.as_ref());
                plms_sample(diffusion, ctx, x, t, order, history)?
            }
        };
        Ok(StepOutput {
            sample: out.sample.detach(),
            pred_xstart: out.pred_xstart.detach(),
            history: out.history,
        })
    }
}

fn p_sample(
    diffusion: &GaussianDiffusion,
    ctx: &StepContext<'_>,
    x: &Tensor,
    t: usize,
    rng: &mut Pcg32,
) -> Result<StepOutput> {
    let out = diffusion.p_mean_variance(ctx.network, x, t, ctx.clip_denoised, ctx.model_kwargs)?;
    let mean = match ctx.guidance {
        Some(guidance) => diffusion.condition_mean(guidance, &out, x, t, ctx.model_kwargs)?,
        None => out.mean.clone(),
    };
    // No noise is added on the final step.
    let sample = if t == 0 {
        mean
    } else {
        let noise = rng.randn_like(x)?;
        let std = out.log_variance.affine(0.5, 0.0)?.exp()?;
        (mean + (std * noise)?)?
    };
    Ok(StepOutput {
        sample,
        pred_xstart: out.pred_xstart,
        history: None,
    })
}

fn ddim_sample(
    diffusion: &GaussianDiffusion,
    ctx: &StepContext<'_>,
    x: &Tensor,
    t: usize,
    eta: f64,
    rng: &mut Pcg32,
) -> Result<StepOutput> {
    let out_orig =
        diffusion.p_mean_variance(ctx.network, x, t, ctx.clip_denoised, ctx.model_kwargs)?;
    let out = match ctx.guidance {
        Some(guidance) => diffusion.condition_score(guidance, &out_orig, x, t, ctx.model_kwargs)?,
        None => out_orig.clone(),
    };
    let eps = diffusion.predict_eps_from_xstart(x, t, &out.pred_xstart)?;

    let alpha_bar = diffusion.alpha_bar(t);
    let alpha_bar_prev = diffusion.alpha_bar_prev(t);
    let sigma = eta
        * ((1.0 - alpha_bar_prev) / (1.0 - alpha_bar)).sqrt()
        * (1.0 - alpha_bar / alpha_bar_prev).sqrt();
    let mean_pred = ((&out.pred_xstart * alpha_bar_prev.sqrt())?
        + (eps * (1.0 - alpha_bar_prev - sigma * sigma).max(0.0).sqrt())?)?;
    let sample = if t == 0 || sigma == 0.0 {
        mean_pred
    } else {
        let noise = rng.randn_like(x)?;
        (mean_pred + (noise * sigma)?)?
    };
    Ok(StepOutput {
        sample,
        pred_xstart: out_orig.pred_xstart,
        history: None,
    })
}

/// Model eps at `(x, t)` after guidance, the guided output, and the raw output.
fn guided_eps(
    diffusion: &GaussianDiffusion,
    ctx: &StepContext<'_>,
    x: &Tensor,
    t: usize,
) -> Result<(Tensor, MeanVariance, MeanVariance)> {
    let out_orig =
        diffusion.p_mean_variance(ctx.network, x, t, ctx.clip_denoised, ctx.model_kwargs)?;
    let out = match ctx.guidance {
        Some(guidance) => diffusion.condition_score(guidance, &out_orig, x, t, ctx.model_kwargs)?,
        None => out_orig.clone(),
    };
    let eps = diffusion.predict_eps_from_xstart(x, t, &out.pred_xstart)?;
    Ok((eps, out, out_orig))
}

/// Adams–Bashforth combination of the most recent eps predictions.
fn adams_bashforth(history: &VecDeque<Tensor>, order: usize) -> Result<Tensor> {
    let n = history.len();
    let cur_order = order.min(n);
    let at = |back: usize| &history[n - 1 - back];
    match cur_order {
        0 => candle_core::bail!("PLMS history is empty"),
        1 => Ok(at(0).clone()),
        2 => ((at(0) * 3.0)? - at(1))? / 2.0,
        3 => (((at(0) * 23.0)? - (at(1) * 16.0)?)? + (at(2) * 5.0)?)? / 12.0,
        _ => {
            let sum = (((at(0) * 55.0)? - (at(1) * 59.0)?)? + (at(2) * 37.0)?)?;
            (sum - (at(3) * 9.0)?)? / 24.0
        }
    }
}

fn plms_sample(
    diffusion: &GaussianDiffusion,
    ctx: &StepContext<'_>,
    x: &Tensor,
    t: usize,
    order: usize,
    previous: Option<&PlmsHistory>,
) -> Result<StepOutput> {
    let alpha_bar_prev = diffusion.alpha_bar_prev(t);
    let sqrt_abp = alpha_bar_prev.sqrt();
    let sqrt_one_minus_abp = (1.0 - alpha_bar_prev).sqrt();

    let (eps, out, out_orig) = guided_eps(diffusion, ctx, x, t)?;

    let (mut old_eps, mean_pred) = match previous {
        None if order > 1 => {
            // Pseudo improved Euler warm-up: average with a second
            // evaluation one step further along.
            let mean_pred = ((&out.pred_xstart * sqrt_abp)? + (&eps * sqrt_one_minus_abp)?)?;
            let (eps_2, _, _) = guided_eps(diffusion, ctx, &mean_pred, t.saturating_sub(1))?;
            let eps_prime = ((&eps + eps_2)? / 2.0)?;
            let pred_prime = diffusion.predict_xstart_from_eps(x, t, &eps_prime)?;
            let mean_pred = ((pred_prime * sqrt_abp)? + (eps_prime * sqrt_one_minus_abp)?)?;
            (VecDeque::from([eps.detach()]), mean_pred)
        }
        _ => {
            let mut old_eps = previous.map(|h| h.eps.clone()).unwrap_or_default();
            old_eps.push_back(eps.detach());
            let eps_prime = adams_bashforth(&old_eps, order)?;
            let pred_prime = diffusion.predict_xstart_from_eps(x, t, &eps_prime)?;
            let mean_pred = ((pred_prime * sqrt_abp)? + (eps_prime * sqrt_one_minus_abp)?)?;
            (old_eps, mean_pred)
        }
    };

    if old_eps.len() >= order {
        old_eps.pop_front();
    }

    let sample = if t == 0 { out.pred_xstart } else { mean_pred };
    Ok(StepOutput {
        sample,
        pred_xstart: out_orig.pred_xstart,
        history: Some(PlmsHistory { eps: old_eps }),
    })
}
