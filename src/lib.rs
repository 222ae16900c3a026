//! Candle-Guided-Diffusion: gradient-guided image diffusion for Candle.
//!
//! Iteratively denoises a noise tensor toward an image that satisfies
//! external guidance objectives, using a pretrained denoising network and a
//! lightweight secondary denoiser that makes guidance gradients cheap.

pub mod config;
pub mod diffusion;
pub mod error;
pub mod guidance;
pub mod loader;
pub mod network;
pub mod pipeline;
pub mod schedule;
pub mod secondary;
pub mod utils;

pub use config::{
    ConfigError, DiffusionConfig, GuidedDiffusionConfig, ModelProfile, NoiseSchedule, SamplerKind,
    SecondaryConfig,
};
pub use diffusion::{GaussianDiffusion, Guidance, OneStepSampler, PlmsHistory, StepOutput};
pub use error::{Error, Result};
pub use guidance::{
    ConditioningTarget, GradientGuidance, GuidanceObjective, GuidanceStrategy,
    ImageDistanceObjective, ImageEncoder, SphericalDistanceObjective,
};
pub use loader::{
    AutoFetcher, BlobFetcher, LoadedModels, LoaderError, ModelCheckpoint, ModelSpec,
    create_models, fetch_if_missing,
};
pub use network::{
    DenoisingNetwork, GradientPolicy, ModelKwargs, NetworkFactory, SublayerRole, TaggedWeights,
};
pub use pipeline::{GuidedDiffusion, SampleOptions};
pub use schedule::DiffusionOutput;
pub use secondary::SecondaryDenoiser;
pub use utils::Pcg32;
