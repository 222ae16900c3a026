//! Configuration structures for guided diffusion sampling

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One-step sampling algorithm driven by the sampling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Ancestral sampling (`p_sample`), Markovian and stochastic.
    Ancestral,
    /// DDIM, deterministic when `eta == 0`.
    Ddim,
    /// Pseudo linear multistep, needs the previous step's eps history.
    Plms,
}

impl FromStr for SamplerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p" | "ancestral" => Ok(Self::Ancestral),
            "ddim" => Ok(Self::Ddim),
            "plms" => Ok(Self::Plms),
            _ => Err(ConfigError::UnknownSampler(s.to_string())),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ancestral => "ancestral",
            Self::Ddim => "ddim",
            Self::Plms => "plms",
        };
        f.write_str(name)
    }
}

/// Beta schedule of the base (un-respaced) diffusion process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSchedule {
    Linear,
    Cosine,
}

impl FromStr for NoiseSchedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            _ => Err(ConfigError::UnknownNoiseSchedule(s.to_string())),
        }
    }
}

/// Gaussian diffusion process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of timesteps the network was trained with (usually 1000)
    #[serde(default = "default_diffusion_steps")]
    pub diffusion_steps: usize,
    pub noise_schedule: NoiseSchedule,
    /// Respacing spec: `"ddim{N}"` for evenly strided DDIM steps or
    /// comma-separated section counts such as `"100"` or `"10,15,20"`
    pub timestep_respacing: String,
    /// Whether the network output carries a learned variance interpolation
    /// in its second half of channels
    pub learn_sigma: bool,
    /// Feed the network timesteps rescaled to the `[0, 1000)` range
    pub rescale_timesteps: bool,
}

fn default_diffusion_steps() -> usize {
    1000
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            diffusion_steps: 1000,
            noise_schedule: NoiseSchedule::Linear,
            timestep_respacing: "100".to_string(),
            learn_sigma: true,
            rescale_timesteps: true,
        }
    }
}

/// Architecture profile of the main denoising network.
///
/// The network itself is opaque to this crate; the profile is handed to the
/// `NetworkFactory` that builds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub image_size: usize,
    pub num_channels: usize,
    pub num_res_blocks: usize,
    pub num_head_channels: usize,
    /// Feature-map resolutions that get self-attention
    pub attention_resolutions: Vec<usize>,
    pub class_cond: bool,
    pub learn_sigma: bool,
    /// Up/down resampling inside residual blocks
    pub resblock_updown: bool,
    pub use_fp16: bool,
    pub use_scale_shift_norm: bool,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            image_size: 512,
            num_channels: 256,
            num_res_blocks: 2,
            num_head_channels: 64,
            attention_resolutions: vec![32, 16, 8],
            class_cond: false,
            learn_sigma: true,
            resblock_updown: true,
            use_fp16: true,
            use_scale_shift_norm: true,
        }
    }
}

impl ModelProfile {
    /// Fixed profile of the unconditional ImageNet checkpoints at the given
    /// native resolution.
    pub fn for_image_size(image_size: usize) -> Self {
        Self {
            image_size,
            ..Default::default()
        }
    }

    /// Channel count of the network output for `in_channels` image channels.
    pub fn out_channels(&self, in_channels: usize) -> usize {
        if self.learn_sigma {
            in_channels * 2
        } else {
            in_channels
        }
    }
}

/// Secondary (fast guidance) denoiser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryConfig {
    /// Image channels in and out
    pub in_channels: usize,
    /// Channel count of the full-resolution stage
    pub base_channels: usize,
    /// Per-level channel multipliers; entry 0 is the full-resolution stem,
    /// the last entry is the bottleneck
    pub channel_mults: Vec<usize>,
    /// Width of the Fourier timestep embedding (must be even)
    pub embed_features: usize,
    /// Standard deviation of the random Fourier projection at init
    pub embed_std: f64,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            base_channels: 64,
            channel_mults: vec![1, 2, 2, 4, 4, 8],
            embed_features: 16,
            embed_std: 1.0,
        }
    }
}

impl SecondaryConfig {
    /// Absolute channel count per level (`[64, 128, 128, 256, 256, 512]` by default).
    pub fn channels(&self) -> Vec<usize> {
        self.channel_mults
            .iter()
            .map(|m| m * self.base_channels)
            .collect()
    }

    /// Number of 2x downsamplings between the stem and the bottleneck.
    pub fn num_downsamples(&self) -> usize {
        self.channel_mults.len().saturating_sub(1)
    }

    /// Spatial dims of the input must be divisible by this.
    pub fn spatial_divisor(&self) -> usize {
        1 << self.num_downsamples()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_mults.len() < 2 {
            return Err(ConfigError::InvalidSecondary(
                "need at least a stem and a bottleneck level".to_string(),
            ));
        }
        if self.embed_features == 0 || self.embed_features % 2 != 0 {
            return Err(ConfigError::InvalidSecondary(format!(
                "embed_features must be even and non-zero, got {}",
                self.embed_features
            )));
        }
        if self.base_channels == 0 || self.channel_mults.contains(&0) {
            return Err(ConfigError::InvalidSecondary(
                "channel counts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration of a `GuidedDiffusion` sampler
#[derive(Debug, Clone)]
pub struct GuidedDiffusionConfig {
    pub sampler: SamplerKind,
    /// Number of respaced sampling steps
    pub timesteps: usize,
    /// Checkpoint identifier (`uncondImageNet512` or `uncondImageNet256`)
    pub checkpoint: String,
    pub device: Device,
    pub ddim_eta: f64,
    pub plms_order: usize,
    /// Guide with the secondary denoiser instead of the main network
    pub fast: bool,
    /// Training timesteps of the main network
    pub diffusion_steps: usize,
    /// Directory checkpoint blobs are cached in
    pub model_dir: PathBuf,
    /// Seed of the run's noise generator
    pub seed: u64,
    /// Show a progress bar while sampling
    pub verbose: bool,
}

impl Default for GuidedDiffusionConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerKind::Ddim,
            timesteps: 100,
            checkpoint: "uncondImageNet512".to_string(),
            device: Device::Cpu,
            ddim_eta: 0.0,
            plms_order: 2,
            fast: true,
            diffusion_steps: 1000,
            model_dir: PathBuf::from("modelzoo"),
            seed: 0,
            verbose: true,
        }
    }
}

impl GuidedDiffusionConfig {
    pub fn new(sampler: SamplerKind, timesteps: usize, device: Device) -> Self {
        Self {
            sampler,
            timesteps,
            device,
            ..Default::default()
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = checkpoint.into();
        self
    }

    pub fn with_ddim_eta(mut self, eta: f64) -> Self {
        self.ddim_eta = eta;
        self
    }

    pub fn with_plms_order(mut self, order: usize) -> Self {
        self.plms_order = order;
        self
    }

    pub fn with_fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = dir.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Respacing string for the configured sampler: DDIM uses evenly strided
    /// steps, the others split the schedule into one equal section.
    pub fn timestep_respacing(&self) -> String {
        match self.sampler {
            SamplerKind::Ddim => format!("ddim{}", self.timesteps),
            _ => self.timesteps.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown sampler '{0}'. Expected one of: p, ancestral, ddim, plms")]
    UnknownSampler(String),
    #[error("Unknown checkpoint '{0}'. Expected uncondImageNet512 or uncondImageNet256")]
    UnknownCheckpoint(String),
    #[error("Unknown noise schedule '{0}'. Expected linear or cosine")]
    UnknownNoiseSchedule(String),
    #[error("Invalid timestep respacing '{spec}': {reason}")]
    InvalidRespacing { spec: String, reason: String },
    #[error("Invalid PLMS order {0}. Must be an integer in 1..=4")]
    InvalidPlmsOrder(usize),
    #[error("Invalid step range: {n_steps} steps from start step {start_step}")]
    InvalidStepRange { start_step: usize, n_steps: usize },
    #[error("Class randomization needs the network's class count, but it reports none")]
    MissingClassCount,
        #[error("Invalid secondary model config: {0}")]
    InvalidSecondary(String),
}
