//! Trigonometric timestep schedule of the secondary denoiser
//!
//! Continuous time `t ∈ [0, 1]` maps to noise-mixing coefficients
//! `alpha = cos(tπ/2)`, `sigma = sin(tπ/2)`, so `alpha² + sigma² = 1`.
//! A velocity prediction `v` at `(x, t)` determines both the denoised image
//! and the noise:
//!
//! ```text
//! pred = x·alpha − v·sigma
//! eps  = x·sigma + v·alpha
//! ```

use candle_core::{Result, Tensor};
use std::f64::consts::FRAC_PI_2;

/// Scalar `(alpha, sigma)` at continuous time `t`.
pub fn alpha_sigma(t: f64) -> (f64, f64) {
    let angle = t * FRAC_PI_2;
    (angle.cos(), angle.sin())
}

/// Continuous time whose `(alpha, sigma)` has the same angle as the inputs.
///
/// Used to translate a discrete diffusion step (`√ᾱ`, `√(1−ᾱ)`) into the
/// secondary denoiser's time axis.
pub fn alpha_sigma_to_t(alpha: f64, sigma: f64) -> f64 {
    sigma.atan2(alpha) / FRAC_PI_2
}

/// Per-sample `(alpha, sigma)` for a batch of timesteps `t` of shape `(B,)`,
/// returned with shape `(B, 1, .., 1)` matching `rank`.
pub fn t_to_alpha_sigma(t: &Tensor, rank: usize) -> Result<(Tensor, Tensor)> {
    let angle = t.affine(FRAC_PI_2, 0.0)?;
    let alpha = append_dims(&angle.cos()?, rank)?;
    let sigma = append_dims(&angle.sin()?, rank)?;
    Ok((alpha, sigma))
}

/// Append trailing unit dims until `x` has `rank` dims.
pub(crate) fn append_dims(x: &Tensor, rank: usize) -> Result<Tensor> {
    let mut dims = x.dims().to_vec();
    if dims.len() > rank {
        candle_core::bail!("cannot append dims: rank {} > target {rank}", dims.len());
    }
    dims.resize(rank, 1);
    x.reshape(dims)
}

/// Velocity, denoised image and noise estimates for one `(x, t)`.
///
/// Only constructible from `(x, t, v)`, so `pred` and `eps` always satisfy
/// the alpha/sigma algebra with respect to `v`.
#[derive(Debug, Clone)]
pub struct DiffusionOutput {
    v: Tensor,
    pred: Tensor,
    eps: Tensor,
}

impl DiffusionOutput {
    pub fn from_velocity(x: &Tensor, t: &Tensor, v: Tensor) -> Result<Self> {
        let (alpha, sigma) = t_to_alpha_sigma(t, v.rank())?;
        let alpha = alpha.to_dtype(v.dtype())?;
        let sigma = sigma.to_dtype(v.dtype())?;
        let pred = (x.broadcast_mul(&alpha)? - v.broadcast_mul(&sigma)?)?;
        let eps = (x.broadcast_mul(&sigma)? + v.broadcast_mul(&alpha)?)?;
        Ok(Self { v, pred, eps })
    }

    pub fn v(&self) -> &Tensor {
        &self.v
    }

    pub fn pred(&self) -> &Tensor {
        &self.pred
    }

    pub fn eps(&self) -> &Tensor {
        &self.eps
    }

    pub fn into_parts(self) -> (Tensor, Tensor, Tensor) {
        (self.v, self.pred, self.eps)
    }

    /// Recover the velocity from a `(pred, eps)` pair: `v = eps·alpha − pred·sigma`.
    pub fn velocity_from(pred: &Tensor, eps: &Tensor, t: &Tensor) -> Result<Tensor> {
        let (alpha, sigma) = t_to_alpha_sigma(t, pred.rank())?;
        let alpha = alpha.to_dtype(pred.dtype())?;
        let sigma = sigma.to_dtype(pred.dtype())?;
        eps.broadcast_mul(&alpha)? - pred.broadcast_mul(&sigma)?
    }

    /// Recover the noisy input: `x = pred·alpha + eps·sigma`.
    pub fn input_from(pred: &Tensor, eps: &Tensor, t: &Tensor) -> Result<Tensor> {
        let (alpha, sigma) = t_to_alpha_sigma(t, pred.rank())?;
        let alpha = alpha.to_dtype(pred.dtype())?;
        let sigma = sigma.to_dtype(pred.dtype())?;
        pred.broadcast_mul(&alpha)? + eps.broadcast_mul(&sigma)?
    }
}
