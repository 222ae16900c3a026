use candle_core::{Device, Result, Shape, Tensor};

const DEFAULT_STREAM: u64 = 0xda3e_39cb_94b9_5bdb;

/// PCG32 (XSH-RR) random number generator.
///
/// Sampling draws every stochastic tensor (initial noise, ancestral and DDIM
/// noise, forward-noising noise, randomized class labels) from one of these,
/// so a run is reproducible from its seed on any backend, including CPU where
/// `Device::set_seed` is unsupported.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
    spare_gaussian: Option<f32>,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
            spare_gaussian: None,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Seeded generator on the default stream.
    pub fn seeded(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform float in `[0, 1)` with 24 bits of precision.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Standard normal sample (Box-Muller, the second value is cached).
    pub fn next_gaussian(&mut self) -> f32 {
        if let Some(z) = self.spare_gaussian.take() {
            return z;
        }
        let u1 = loop {
            let u = self.next_f32();
            if u > 1e-7 {
                break u;
            }
        };
        let u2 = self.next_f32();
        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        self.spare_gaussian = Some(mag * angle.sin());
        mag * angle.cos()
    }

    /// Uniform integer in `[0, high)`. `high` must be non-zero.
    pub fn next_below(&mut self, high: u32) -> u32 {
        // Lemire's multiply-shift; the bias is negligible for class counts.
        ((self.next_u32() as u64 * high as u64) >> 32) as u32
    }

    /// Tensor of standard normal noise.
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.next_gaussian())
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Noise with the shape, dtype and device of `like`.
    pub fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        self.randn(like.shape(), like.device())?
            .to_dtype(like.dtype())
    }

    /// Tensor of uniform integer labels in `[0, high)`.
    pub fn randint(&mut self, high: usize, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        if high == 0 || high > u32::MAX as usize {
            candle_core::bail!("randint upper bound must be in 1..=u32::MAX, got {high}");
        }
        let shape = shape.into();
        let data: Vec<u32> = (0..shape.elem_count())
            .map(|_| self.next_below(high as u32))
            .collect();
        Tensor::from_vec(data, shape, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = Pcg32::seeded(42);
        let mut b = Pcg32::seeded(42);
        for _ in 0..16 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = Pcg32::seeded(1);
        let mut b = Pcg32::seeded(2);
        let xs: Vec<u32> = (0..8).map(|_| a.next_u32()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.next_u32()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_gaussian_moments() {
        let mut rng = Pcg32::seeded(7);
        let n = 20_000;
        let samples: Vec<f32> = (0..n).map(|_| rng.next_gaussian()).collect();
        let mean = samples.iter().sum::<f32>() / n as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.05, "var = {var}");
    }

    #[test]
    fn test_randint_bounds() -> Result<()> {
        let mut rng = Pcg32::seeded(3);
        let labels = rng.randint(10, (64,), &Device::Cpu)?;
        let labels = labels.to_vec1::<u32>()?;
        assert!(labels.iter().all(|&l| l < 10));
        Ok(())
    }

    #[test]
    fn test_randn_shape() -> Result<()> {
        let mut rng = Pcg32::seeded(0);
        let t = rng.randn((2, 3, 4, 4), &Device::Cpu)?;
        assert_eq!(t.dims(), &[2, 3, 4, 4]);
        assert_eq!(t.dtype(), DType::F32);
        Ok(())
    }
}
