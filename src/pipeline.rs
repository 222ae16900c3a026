//! Guided diffusion sampling loop
//!
//! [`GuidedDiffusion`] owns the models, the guidance strategy and the bound
//! one-step sampler, and drives a reverse diffusion run:
//!
//! 1. register the run's conditioning targets with the guidance objectives
//! 2. optionally forward-noise the start image
//! 3. step from `start_step - 1` down to `start_step - n_steps`, replacing
//!    the image with each step's sample

use candle_core::{Shape, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ConfigError, GuidedDiffusionConfig};
use crate::diffusion::{GaussianDiffusion, OneStepSampler, StepContext, StepOutput};
use crate::error::{Error, Result};
use crate::guidance::{ConditioningTarget, GradientGuidance, GuidanceObjective, GuidanceStrategy};
use crate::loader::{BlobFetcher, LoadedModels, ModelSpec, create_models};
use crate::network::{DenoisingNetwork, ModelKwargs, ParameterRegistry};
use crate::utils::Pcg32;

/// Per-run options of [`GuidedDiffusion::sample`].
#[derive(Debug, Clone, Default)]
pub struct SampleOptions {
    pub model_kwargs: ModelKwargs,
    /// Draw fresh class labels before every step (only when `y` is set).
    /// The network must report its class count.
    pub randomize_class: bool,
    /// Forward-noise the start image to this step first. `None` means
    /// `start_step`; `Some(0)` leaves the image untouched.
    pub q_sample: Option<usize>,
    /// Noise for the forward-noising; drawn from the run's generator when
    /// absent.
    pub noise: Option<Tensor>,
    /// Clamp the model's denoised estimates to `[-1, 1]`.
    pub clip_denoised: bool,
}

/// Guided diffusion sampler
pub struct GuidedDiffusion {
    config: GuidedDiffusionConfig,
    network: Arc<dyn DenoisingNetwork>,
    diffusion: GaussianDiffusion,
    guidance: GradientGuidance,
    sampler: OneStepSampler,
    parameters: ParameterRegistry,
    rng: Pcg32,
}

impl GuidedDiffusion {
    /// Fetch and load the checkpoints named by `config`, then wire the
    /// guidance strategy and sampler.
    pub fn new(
        config: GuidedDiffusionConfig,
        objectives: Vec<Box<dyn GuidanceObjective>>,
        fetcher: &dyn BlobFetcher,
        factory: &dyn crate::network::NetworkFactory,
    ) -> Result<Self> {
        // Reject a bad sampler setup before downloading anything.
        OneStepSampler::new(config.sampler, config.ddim_eta, config.plms_order)?;
        let spec = ModelSpec::from_config(&config)?;
        info!(
            sampler = %config.sampler,
            timesteps = config.timesteps,
            checkpoint = %config.checkpoint,
            fast = config.fast,
            "Creating guided diffusion sampler"
        );
        let models = create_models(&spec, fetcher, factory)?;
        Self::from_parts(config, models, objectives)
    }

    /// Build from already constructed models.
    ///
    /// The step count comes from `models.diffusion`; `config.timesteps` and
    /// `config.checkpoint` are not consulted.
    pub fn from_parts(
        config: GuidedDiffusionConfig,
        models: LoadedModels,
        objectives: Vec<Box<dyn GuidanceObjective>>,
    ) -> Result<Self> {
        let sampler = OneStepSampler::new(config.sampler, config.ddim_eta, config.plms_order)?;
        let strategy = if config.fast {
            let secondary = models.secondary.ok_or(Error::MissingSecondary)?;
            GuidanceStrategy::Fast { secondary }
        } else {
            GuidanceStrategy::Full {
                network: models.network.clone(),
            }
        };
        let rng = Pcg32::seeded(config.seed);
        Ok(Self {
            network: models.network,
            diffusion: models.diffusion,
            guidance: GradientGuidance::new(strategy, objectives),
            sampler,
            parameters: models.parameters,
            rng,
            config,
        })
    }

    pub fn config(&self) -> &GuidedDiffusionConfig {
        &self.config
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn sampler(&self) -> OneStepSampler {
        self.sampler
    }

    pub fn guidance(&self) -> &GradientGuidance {
        &self.guidance
    }

    /// Parameters of the main network and their gradient mode.
    pub fn parameters(&self) -> &ParameterRegistry {
        &self.parameters
    }

    /// Restart the noise generator.
    pub fn reseed(&mut self, seed: u64) {
        self.config.seed = seed;
        self.rng = Pcg32::seeded(seed);
    }

    /// Denoise `img` for `n_steps` steps starting at respaced step
    /// `start_step`.
    pub fn sample(
        &mut self,
        img: &Tensor,
        targets: &[ConditioningTarget],
        start_step: usize,
        n_steps: usize,
        opts: SampleOptions,
    ) -> Result<Tensor> {
        let num_timesteps = self.diffusion.num_timesteps();
        if n_steps > start_step || start_step > num_timesteps {
            return Err(ConfigError::InvalidStepRange {
                start_step,
                n_steps,
            }
            .into());
        }
        let q_sample = opts.q_sample.unwrap_or(start_step);
        if q_sample > num_timesteps {
            return Err(ConfigError::InvalidStepRange {
                start_step: q_sample,
                n_steps,
            }
            .into());
        }

        let label_classes = match (&opts.model_kwargs.y, opts.randomize_class) {
            (Some(_), true) => Some(
                self.network
                    .num_classes()
                    .ok_or(ConfigError::MissingClassCount)?,
            ),
            _ => None,
        };

        self.guidance.set_targets(targets)?;

        let mut img = img.clone();
        if q_sample > 0 {
            let noise = match opts.noise {
                Some(noise) => noise,
                None => self.rng.randn_like(&img)?,
            };
            img = self.diffusion.q_sample(&img, q_sample - 1, &noise)?;
            debug!(step = q_sample - 1, "Forward-noised start image");
        }

        let mut model_kwargs = opts.model_kwargs;
        let progress = self.progress_bar(n_steps);
        let mut previous: Option<StepOutput> = None;

        for i in (start_step - n_steps..start_step).rev() {
            if let (Some(classes), Some(y)) = (label_classes, &model_kwargs.y) {
                let labels = self
                    .rng
                    .randint(classes, y.shape(), y.device())?
                    .to_dtype(y.dtype())?;
                model_kwargs.y = Some(labels);
            }

            let ctx = StepContext {
                network: self.network.as_ref(),
                guidance: Some(&self.guidance),
                model_kwargs: &model_kwargs,
                clip_denoised: opts.clip_denoised,
            };
            let out = self.sampler.step(
                &self.diffusion,
                &ctx,
                &img,
                i,
                previous.as_ref(),
                &mut self.rng,
            )?;
            debug!(step = i, "Sampler step");
            img = out.sample.clone();
            previous = self.sampler.needs_history().then_some(out);
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok(img)
    }

    /// Sample a fresh image of `shape` from pure noise over the full
    /// respaced schedule.
    pub fn generate(
        &mut self,
        shape: impl Into<Shape>,
        targets: &[ConditioningTarget],
        model_kwargs: ModelKwargs,
    ) -> Result<Tensor> {
        let img = self.rng.randn(shape, &self.config.device)?;
        let steps = self.diffusion.num_timesteps();
        self.sample(
            &img,
            targets,
            steps,
            steps,
            SampleOptions {
                model_kwargs,
                ..Default::default()
            },
        )
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.verbose {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({per_sec}, {eta})")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(self.sampler.kind().to_string());
        bar
    }
}
