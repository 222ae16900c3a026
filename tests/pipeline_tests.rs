//! Tests for the guided diffusion sampling loop
//!
//! Covers:
//! - step counts and descending timestep order
//! - PLMS history threading
//! - forward noising of the start image
//! - end-to-end generation with fast guidance
//! - determinism and configuration errors

use std::cell::RefCell;
use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use candle_guided_diffusion::guidance::ImageDistanceObjective;
use candle_guided_diffusion::network::ParameterRegistry;
use candle_guided_diffusion::secondary::random_secondary;
use candle_guided_diffusion::{
    ConditioningTarget, ConfigError, DenoisingNetwork, DiffusionConfig, Error, GaussianDiffusion,
    GuidanceObjective, GuidedDiffusion, GuidedDiffusionConfig, LoadedModels, ModelKwargs, Pcg32,
    SampleOptions, SamplerKind, SecondaryConfig,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Predicts a small constant noise and records every call.
#[derive(Default)]
struct RecordingNetwork {
    timesteps: RefCell<Vec<f32>>,
    labels: RefCell<Vec<u32>>,
    label_dtypes: RefCell<Vec<DType>>,
    num_classes: Option<usize>,
}

impl DenoisingNetwork for RecordingNetwork {
    fn forward(&self, x: &Tensor, timesteps: &Tensor, kwargs: &ModelKwargs) -> Result<Tensor> {
        self.timesteps
            .borrow_mut()
            .extend(timesteps.to_vec1::<f32>()?);
        if let Some(y) = &kwargs.y {
            self.label_dtypes.borrow_mut().push(y.dtype());
            self.labels
                .borrow_mut()
                .extend(y.to_dtype(DType::U32)?.to_vec1::<u32>()?);
        }
        let eps = x.ones_like()?.affine(0.05, 0.0)?;
        Tensor::cat(&[&eps, &x.zeros_like()?], 1)
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }
}

/// 50 training steps sampled one to one, so the network sees `t = i`.
fn small_diffusion() -> GaussianDiffusion {
    GaussianDiffusion::new(DiffusionConfig {
        diffusion_steps: 50,
        timestep_respacing: "50".to_string(),
        rescale_timesteps: false,
        ..Default::default()
    })
    .unwrap()
}

fn config(sampler: SamplerKind) -> GuidedDiffusionConfig {
    GuidedDiffusionConfig::new(sampler, 50, Device::Cpu)
        .with_fast(false)
        .with_verbose(false)
        .with_seed(42)
}

fn pipeline(
    config: GuidedDiffusionConfig,
    network: Arc<RecordingNetwork>,
    objectives: Vec<Box<dyn GuidanceObjective>>,
) -> candle_guided_diffusion::Result<GuidedDiffusion> {
    let secondary = if config.fast {
        let secondary_config = SecondaryConfig {
            base_channels: 4,
            ..Default::default()
        };
        let (model, _varmap) = random_secondary(secondary_config, &Device::Cpu)?;
        Some(Arc::new(model))
    } else {
        None
    };
    let models = LoadedModels {
        network,
        diffusion: small_diffusion(),
        secondary,
        parameters: ParameterRegistry::default(),
    };
    GuidedDiffusion::from_parts(config, models, objectives)
}

fn image(shape: (usize, usize, usize, usize), seed: u64) -> Result<Tensor> {
    Pcg32::seeded(seed).randn(shape, &Device::Cpu)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

// ============================================================================
// Step Counts
// ============================================================================

#[test]
fn test_sample_runs_exactly_n_steps_descending() -> anyhow::Result<()> {
    for sampler in [SamplerKind::Ancestral, SamplerKind::Ddim] {
        let network = Arc::new(RecordingNetwork::default());
        let mut gd = pipeline(config(sampler), network.clone(), Vec::new())?;
        let img = image((1, 3, 8, 8), 0)?;
        gd.sample(&img, &[], 30, 10, SampleOptions::default())?;

        let seen = network.timesteps.borrow();
        let expected: Vec<f32> = (20..30).rev().map(|t| t as f32).collect();
        assert_eq!(*seen, expected, "{sampler}");
    }
    Ok(())
}

#[test]
fn test_full_run_reaches_step_zero() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let mut gd = pipeline(config(SamplerKind::Ddim), network.clone(), Vec::new())?;
    let img = image((1, 3, 8, 8), 1)?;
    let out = gd.sample(&img, &[], 50, 50, SampleOptions::default())?;
    assert_eq!(out.dims(), &[1, 3, 8, 8]);
    let seen = network.timesteps.borrow();
    assert_eq!(seen.len(), 50);
    assert_eq!(seen.first(), Some(&49.0));
    assert_eq!(seen.last(), Some(&0.0));
    Ok(())
}

#[test]
fn test_plms_threads_history() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let cfg = config(SamplerKind::Plms).with_plms_order(2);
    let mut gd = pipeline(cfg, network.clone(), Vec::new())?;
    let img = image((1, 3, 8, 8), 2)?;
    gd.sample(&img, &[], 5, 5, SampleOptions::default())?;

    // Only the first step lacks history and runs the extra warm-up
    // evaluation one step further along.
    let seen = network.timesteps.borrow();
    assert_eq!(*seen, vec![4.0, 3.0, 3.0, 2.0, 1.0, 0.0]);
    Ok(())
}

#[test]
fn test_step_range_validation() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let mut gd = pipeline(config(SamplerKind::Ddim), network, Vec::new())?;
    let img = image((1, 3, 8, 8), 3)?;
    let err = gd
        .sample(&img, &[], 5, 6, SampleOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::InvalidStepRange {
            start_step: 5,
            n_steps: 6
        })
    ));
    assert!(gd.sample(&img, &[], 51, 1, SampleOptions::default()).is_err());
    Ok(())
}

// ============================================================================
// Forward Noising
// ============================================================================

#[test]
fn test_q_sample_zero_leaves_image_unmodified() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let mut gd = pipeline(config(SamplerKind::Ddim), network, Vec::new())?;
    let img = image((1, 3, 8, 8), 4)?;

    let opts = SampleOptions {
        q_sample: Some(0),
        ..Default::default()
    };
    let out = gd.sample(&img, &[], 10, 0, opts)?;
    assert_eq!(max_abs_diff(&out, &img)?, 0.0);

    // The default forward-noises at start_step - 1.
    let noised = gd.sample(&img, &[], 10, 0, SampleOptions::default())?;
    assert!(max_abs_diff(&noised, &img)? > 0.0);
    Ok(())
}

#[test]
fn test_q_sample_uses_explicit_noise() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let mut gd = pipeline(config(SamplerKind::Ddim), network, Vec::new())?;
    let img = image((1, 3, 8, 8), 5)?;
    let noise = image((1, 3, 8, 8), 6)?;

    let opts = SampleOptions {
        q_sample: Some(20),
        noise: Some(noise.clone()),
        ..Default::default()
    };
    let out = gd.sample(&img, &[], 10, 0, opts)?;
    let expected = gd.diffusion().q_sample(&img, 19, &noise)?;
    assert!(max_abs_diff(&out, &expected)? < 1e-6);
    Ok(())
}

// ============================================================================
// Class Labels
// ============================================================================

#[test]
fn test_randomize_class_draws_valid_labels() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork {
        num_classes: Some(10),
        ..Default::default()
    });
    let mut gd = pipeline(config(SamplerKind::Ddim), network.clone(), Vec::new())?;
    let img = image((2, 3, 8, 8), 7)?;
    let y = Tensor::new(&[3u32, 3], &Device::Cpu)?;
    let opts = SampleOptions {
        model_kwargs: ModelKwargs::with_labels(y),
        randomize_class: true,
        ..Default::default()
    };
    gd.sample(&img, &[], 20, 20, opts)?;

    let labels = network.labels.borrow();
    assert_eq!(labels.len(), 40);
    assert!(labels.iter().all(|&l| l < 10));
    assert!(labels.iter().any(|&l| l != 3));
    Ok(())
}

#[test]
fn test_randomize_class_keeps_label_dtype() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork {
        num_classes: Some(10),
        ..Default::default()
    });
    let mut gd = pipeline(config(SamplerKind::Ddim), network.clone(), Vec::new())?;
    let img = image((2, 3, 8, 8), 11)?;
    let y = Tensor::new(&[3i64, 3], &Device::Cpu)?;
    let opts = SampleOptions {
        model_kwargs: ModelKwargs::with_labels(y),
        randomize_class: true,
        ..Default::default()
    };
    gd.sample(&img, &[], 5, 5, opts)?;

    let dtypes = network.label_dtypes.borrow();
    assert_eq!(dtypes.len(), 5);
    assert!(dtypes.iter().all(|&d| d == DType::I64));
    assert!(network.labels.borrow().iter().all(|&l| l < 10));
    Ok(())
}

#[test]
fn test_randomize_class_requires_class_count() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let mut gd = pipeline(config(SamplerKind::Ddim), network.clone(), Vec::new())?;
    let img = image((1, 3, 8, 8), 12)?;
    let opts = SampleOptions {
        model_kwargs: ModelKwargs::with_labels(Tensor::new(&[3u32], &Device::Cpu)?),
        randomize_class: true,
        ..Default::default()
    };
    let err = gd.sample(&img, &[], 5, 5, opts).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::MissingClassCount)));
    assert!(network.timesteps.borrow().is_empty());
    Ok(())
}

#[test]
fn test_randomize_class_without_labels_is_noop() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let mut gd = pipeline(config(SamplerKind::Ddim), network.clone(), Vec::new())?;
    let img = image((1, 3, 8, 8), 8)?;
    let opts = SampleOptions {
        randomize_class: true,
        ..Default::default()
    };
    gd.sample(&img, &[], 5, 5, opts)?;
    assert!(network.labels.borrow().is_empty());
    Ok(())
}

// ============================================================================
// Generation
// ============================================================================

#[test]
fn test_generate_with_fast_guidance() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let cfg = config(SamplerKind::Ddim).with_fast(true);
    let objectives: Vec<Box<dyn GuidanceObjective>> = vec![Box::new(ImageDistanceObjective::new())];
    let mut gd = pipeline(cfg, network.clone(), objectives)?;
    assert!(gd.guidance().strategy().is_fast());

    let target = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu)?;
    let out = gd.generate(
        (1, 3, 64, 64),
        &[ConditioningTarget::image(target)],
        ModelKwargs::default(),
    )?;

    assert_eq!(out.dims(), &[1, 3, 64, 64]);
    assert_eq!(network.timesteps.borrow().len(), 50);
    let finite = out.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| v.is_finite());
    assert!(finite);
    Ok(())
}

#[test]
fn test_same_seed_same_output() -> anyhow::Result<()> {
    let run = |seed: u64| -> anyhow::Result<Tensor> {
        let network = Arc::new(RecordingNetwork::default());
        let cfg = config(SamplerKind::Ancestral).with_seed(seed);
        let mut gd = pipeline(cfg, network, Vec::new())?;
        let img = image((1, 3, 8, 8), 9)?;
        let opts = SampleOptions {
            noise: Some(image((1, 3, 8, 8), 10)?),
            ..Default::default()
        };
        Ok(gd.sample(&img, &[], 20, 20, opts)?)
    };
    let a = run(1)?;
    let b = run(1)?;
    let c = run(2)?;
    assert_eq!(max_abs_diff(&a, &b)?, 0.0);
    assert!(max_abs_diff(&a, &c)? > 0.0);
    Ok(())
}

#[test]
fn test_reseed_restarts_noise() -> anyhow::Result<()> {
    let network = Arc::new(RecordingNetwork::default());
    let mut gd = pipeline(config(SamplerKind::Ancestral), network, Vec::new())?;
    let a = gd.generate((1, 3, 8, 8), &[], ModelKwargs::default())?;
    gd.reseed(42);
    let b = gd.generate((1, 3, 8, 8), &[], ModelKwargs::default())?;
    assert_eq!(max_abs_diff(&a, &b)?, 0.0);
    Ok(())
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[test]
fn test_unknown_sampler_kind() {
    assert!(matches!(
        "k_euler".parse::<SamplerKind>(),
        Err(ConfigError::UnknownSampler(_))
    ));
}

#[test]
fn test_invalid_plms_order() {
    let network = Arc::new(RecordingNetwork::default());
    let cfg = config(SamplerKind::Plms).with_plms_order(7);
    let result = pipeline(cfg, network, Vec::new());
    assert!(matches!(
        result,
        Err(Error::Config(ConfigError::InvalidPlmsOrder(7)))
    ));
}

#[test]
fn test_fast_guidance_requires_secondary() {
    let models = LoadedModels {
        network: Arc::new(RecordingNetwork::default()),
        diffusion: small_diffusion(),
        secondary: None,
        parameters: ParameterRegistry::default(),
    };
    let cfg = config(SamplerKind::Ddim).with_fast(true);
    let result = GuidedDiffusion::from_parts(cfg, models, Vec::new());
    assert!(matches!(result, Err(Error::MissingSecondary)));
}
