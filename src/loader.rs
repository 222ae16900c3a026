//! Checkpoint retrieval and model construction
//!
//! This module covers everything between a checkpoint identifier and ready
//! to run models:
//!
//! - the catalog of published checkpoints and where to download them
//! - blob fetchers for plain HTTP(S) URLs and `hf://owner/repo/file` hub paths
//! - weight loading from `.safetensors` or PyTorch `.pt`/`.pth` files
//! - [`create_models`], which builds the main network, the diffusion process
//!   and (optionally) the secondary denoiser

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use indicatif::{ProgressBar, ProgressStyle};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{
    ConfigError, DiffusionConfig, GuidedDiffusionConfig, ModelProfile, NoiseSchedule,
    SecondaryConfig,
};
use crate::diffusion::GaussianDiffusion;
use crate::network::{DenoisingNetwork, GradientPolicy, NetworkFactory, ParameterRegistry, TaggedWeights};
use crate::secondary::SecondaryDenoiser;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while fetching or loading checkpoints
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("HTTP request failed: {url}")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    #[error("Hugging Face hub download failed: {url}")]
    Hub {
        url: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },

    #[error("Unsupported checkpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported weight file format: {path}")]
    UnsupportedFormat { path: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

// =============================================================================
// Checkpoint Catalog
// =============================================================================

/// A published checkpoint blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCheckpoint {
    pub id: &'static str,
    pub file_name: &'static str,
    pub url: &'static str,
    /// Native resolution of the main network; 0 for the secondary model.
    pub image_size: usize,
}

/// Unconditional ImageNet main networks.
pub const CHECKPOINTS: [ModelCheckpoint; 2] = [
    ModelCheckpoint {
        id: "uncondImageNet512",
        file_name: "512x512_diffusion_uncond_finetune_008100.pt",
        url: "https://the-eye.eu/public/AI/models/512x512_diffusion_unconditional_ImageNet/512x512_diffusion_uncond_finetune_008100.pt",
        image_size: 512,
    },
    ModelCheckpoint {
        id: "uncondImageNet256",
        file_name: "256x256_diffusion_uncond.pt",
        url: "https://openaipublic.blob.core.windows.net/diffusion/jul-2021/256x256_diffusion_uncond.pt",
        image_size: 256,
    },
];

pub const SECONDARY_CHECKPOINT: ModelCheckpoint = ModelCheckpoint {
    id: "secondary",
    file_name: "secondary_model_imagenet_2.pth",
    url: "https://the-eye.eu/public/AI/models/v-diffusion/secondary_model_imagenet_2.pth",
    image_size: 0,
};

impl ModelCheckpoint {
    pub fn lookup(id: &str) -> Result<Self, ConfigError> {
        CHECKPOINTS
            .iter()
            .find(|c| c.id == id)
            .copied()
            .ok_or_else(|| ConfigError::UnknownCheckpoint(id.to_string()))
    }

    pub fn path_in(&self, model_dir: impl AsRef<Path>) -> PathBuf {
        model_dir.as_ref().join(self.file_name)
    }
}

// =============================================================================
// Blob Fetchers
// =============================================================================

/// Downloads a blob from `url` to `path`.
pub trait BlobFetcher {
    fn fetch(&self, url: &str, path: &Path) -> Result<(), LoaderError>;
}

/// Plain HTTP(S) downloads, streamed to a `.part` file and renamed on
/// completion.
pub struct HttpFetcher {
    agent: ureq::Agent,
    show_progress: bool,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

impl BlobFetcher for HttpFetcher {
    fn fetch(&self, url: &str, path: &Path) -> Result<(), LoaderError> {
        create_parent_dir(path)?;
        let response = self.agent.get(url).call().map_err(|e| LoaderError::Http {
            url: url.to_string(),
            source: Box::new(e),
        })?;
        let total = response
            .header("Content-Length")
            .and_then(|len| len.parse::<u64>().ok());

        let progress = match (self.show_progress, total) {
            (true, Some(len)) => download_bar(len),
            _ => ProgressBar::hidden(),
        };
        let reader = progress.wrap_read(response.into_reader());
        let result = stream_to_file(reader, path);
        progress.finish_and_clear();
        result
    }
}

/// Stream `reader` into `<path>.part` and rename it to `path` once complete.
/// The partial file is removed when any step fails.
fn stream_to_file(mut reader: impl Read, path: &Path) -> Result<(), LoaderError> {
    let partial = path.with_extension("part");
    let result = write_partial(&mut reader, &partial).and_then(|()| {
        std::fs::rename(&partial, path).map_err(|source| LoaderError::FileWrite {
            path: path.display().to_string(),
            source,
        })
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

fn write_partial(reader: &mut impl Read, partial: &Path) -> Result<(), LoaderError> {
    let write_err = |source| LoaderError::FileWrite {
        path: partial.display().to_string(),
        source,
    };
    let file = File::create(partial).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    std::io::copy(reader, &mut writer).map_err(write_err)?;
    writer.flush().map_err(write_err)
}

fn download_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message("downloading");
    bar
}

/// Split `hf://owner/repo/path/to/file` into `("owner/repo", "path/to/file")`.
pub fn parse_hub_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("hf://")?;
    let mut parts = rest.splitn(3, '/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty())?;
    let file = parts.next().filter(|s| !s.is_empty())?;
    Some((format!("{owner}/{repo}"), file.to_string()))
}

/// Downloads `hf://owner/repo/file` through the Hugging Face hub cache and
/// copies the blob into place.
pub struct HubFetcher {
    api: hf_hub::api::sync::Api,
}

impl HubFetcher {
    pub fn new() -> Result<Self, LoaderError> {
        let api = hf_hub::api::sync::Api::new().map_err(|source| LoaderError::Hub {
            url: "hf://".to_string(),
            source,
        })?;
        Ok(Self { api })
    }
}

impl BlobFetcher for HubFetcher {
    fn fetch(&self, url: &str, path: &Path) -> Result<(), LoaderError> {
        let (repo_id, file) =
            parse_hub_url(url).ok_or_else(|| LoaderError::InvalidUrl(url.to_string()))?;
        let cached = self
            .api
            .repo(hf_hub::Repo::new(repo_id, hf_hub::RepoType::Model))
            .get(&file)
            .map_err(|source| LoaderError::Hub {
                url: url.to_string(),
                source,
            })?;
        create_parent_dir(path)?;
        std::fs::copy(&cached, path).map_err(|source| LoaderError::FileWrite {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

/// Dispatches on the URL scheme: `hf://` to the hub, everything else over
/// HTTP. The hub client is created on first use.
#[derive(Default)]
pub struct AutoFetcher {
    http: HttpFetcher,
    hub: std::sync::OnceLock<HubFetcher>,
}

impl AutoFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> Result<&HubFetcher, LoaderError> {
        if let Some(hub) = self.hub.get() {
            return Ok(hub);
        }
        let hub = HubFetcher::new()?;
        Ok(self.hub.get_or_init(|| hub))
    }
}

impl BlobFetcher for AutoFetcher {
    fn fetch(&self, url: &str, path: &Path) -> Result<(), LoaderError> {
        if url.starts_with("hf://") {
            self.hub()?.fetch(url, path)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(url, path)
        } else {
            Err(LoaderError::InvalidUrl(url.to_string()))
        }
    }
}

/// Fetch `url` to `path` unless the file already exists.
pub fn fetch_if_missing(
    fetcher: &dyn BlobFetcher,
    url: &str,
    path: impl AsRef<Path>,
) -> Result<PathBuf, LoaderError> {
    let path = path.as_ref();
    if path.exists() {
        debug!(path = %path.display(), "Checkpoint present, skipping download");
    } else {
        info!(url, path = %path.display(), "Fetching checkpoint");
        fetcher.fetch(url, path)?;
    }
    Ok(path.to_path_buf())
}

fn create_parent_dir(path: &Path) -> Result<(), LoaderError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|source| LoaderError::FileWrite {
                path: dir.display().to_string(),
                source,
            })
        }
        _ => Ok(()),
    }
}

// =============================================================================
// Weight Loading
// =============================================================================

/// Open a weight file as a `VarBuilder`, picking the reader by extension.
pub fn load_var_builder(
    path: impl AsRef<Path>,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>, LoaderError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(LoaderError::FileRead {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let vb = match ext.as_deref() {
        Some("safetensors") => unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? },
        Some("pt") | Some("pth") | Some("bin") => VarBuilder::from_pth(path, dtype, device)?,
        _ => {
            return Err(LoaderError::UnsupportedFormat {
                path: path.display().to_string(),
            });
        }
    };
    Ok(vb)
}

/// Load a JSON config file (model profile, secondary config, ...).
pub fn load_json_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| LoaderError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| LoaderError::JsonParse {
        path: path.display().to_string(),
        source,
    })
}

/// Weight dtype for a profile on a device: half precision only off-CPU.
pub fn weight_dtype(profile: &ModelProfile, device: &Device) -> DType {
    if profile.use_fp16 && !device.is_cpu() {
        DType::F16
    } else {
        DType::F32
    }
}

// =============================================================================
// Model Construction
// =============================================================================

/// Everything needed to build the models of one sampler.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub checkpoint: ModelCheckpoint,
    pub profile: ModelProfile,
    pub diffusion: DiffusionConfig,
    /// Load the secondary denoiser with this config.
    pub secondary: Option<SecondaryConfig>,
    pub secondary_checkpoint: ModelCheckpoint,
    pub policy: GradientPolicy,
    pub model_dir: PathBuf,
    pub device: Device,
}

impl ModelSpec {
    pub fn from_config(config: &GuidedDiffusionConfig) -> Result<Self, ConfigError> {
        let checkpoint = ModelCheckpoint::lookup(&config.checkpoint)?;
        let profile = ModelProfile::for_image_size(checkpoint.image_size);
        let diffusion = DiffusionConfig {
            diffusion_steps: config.diffusion_steps,
            noise_schedule: NoiseSchedule::Linear,
            timestep_respacing: config.timestep_respacing(),
            learn_sigma: profile.learn_sigma,
            rescale_timesteps: true,
        };
        Ok(Self {
            checkpoint,
            profile,
            diffusion,
            secondary: config.fast.then(SecondaryConfig::default),
            secondary_checkpoint: SECONDARY_CHECKPOINT,
            policy: GradientPolicy::default(),
            model_dir: config.model_dir.clone(),
            device: config.device.clone(),
        })
    }
}

/// Models built by [`create_models`].
pub struct LoadedModels {
    pub network: Arc<dyn DenoisingNetwork>,
    pub diffusion: GaussianDiffusion,
    pub secondary: Option<Arc<SecondaryDenoiser>>,
    /// Parameters of the main network and whether they track gradients.
    pub parameters: ParameterRegistry,
}

/// Fetch missing checkpoints and build the main network, the diffusion
/// process and the secondary denoiser.
pub fn create_models(
    spec: &ModelSpec,
    fetcher: &dyn BlobFetcher,
    factory: &dyn NetworkFactory,
) -> Result<LoadedModels, LoaderError> {
    let diffusion = GaussianDiffusion::new(spec.diffusion.clone())?;

    let main_path = fetch_if_missing(
        fetcher,
        spec.checkpoint.url,
        spec.checkpoint.path_in(&spec.model_dir),
    )?;
    let dtype = weight_dtype(&spec.profile, &spec.device);
    info!(
        checkpoint = spec.checkpoint.id,
        dtype = ?dtype,
        "Loading main network"
    );
    let vb = load_var_builder(&main_path, dtype, &spec.device)?;
    let weights = TaggedWeights::new(vb, spec.policy.clone());
    let parameters = weights.registry();
    let network = factory.build(&spec.profile, weights)?;
    debug!(
        parameters = parameters.len(),
        trainable = parameters.trainable_names().len(),
        "Main network built"
    );

    let secondary = match &spec.secondary {
        Some(config) => {
            let path = fetch_if_missing(
                fetcher,
                spec.secondary_checkpoint.url,
                spec.secondary_checkpoint.path_in(&spec.model_dir),
            )?;
            info!("Loading secondary model");
            let vb = load_var_builder(&path, DType::F32, &spec.device)?;
            Some(Arc::new(SecondaryDenoiser::new(vb, config.clone())?))
        }
        None => None,
    };

    Ok(LoadedModels {
        network,
        diffusion,
        secondary,
        parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_lookup() {
        let c = ModelCheckpoint::lookup("uncondImageNet256").unwrap();
        assert_eq!(c.image_size, 256);
        assert_eq!(c.file_name, "256x256_diffusion_uncond.pt");
        assert!(matches!(
            ModelCheckpoint::lookup("cifar10"),
            Err(ConfigError::UnknownCheckpoint(_))
        ));
    }

    #[test]
    fn test_parse_hub_url() {
        assert_eq!(
            parse_hub_url("hf://owner/repo/weights/model.safetensors"),
            Some(("owner/repo".to_string(), "weights/model.safetensors".to_string()))
        );
        assert_eq!(parse_hub_url("hf://owner/repo"), None);
        assert_eq!(parse_hub_url("https://example.com/a.pt"), None);
    }

    /// Yields a few bytes, then fails.
    struct BrokenReader {
        sent: bool,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.sent {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection dropped",
                ));
            }
            self.sent = true;
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&b"data"[..n]);
            Ok(n)
        }
    }

    #[test]
    fn test_stream_to_file_renames_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pt");
        stream_to_file(&b"weights"[..], &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"weights");
        assert!(!path.with_extension("part").exists());
    }

    #[test]
    fn test_failed_stream_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pt");
        let result = stream_to_file(BrokenReader { sent: false }, &path);
        assert!(matches!(result, Err(LoaderError::FileWrite { .. })));
        assert!(!path.exists());
        assert!(!path.with_extension("part").exists());
    }

    #[test]
    fn test_fp16_only_off_cpu() {
        let profile = ModelProfile::default();
        assert!(profile.use_fp16);
        assert_eq!(weight_dtype(&profile, &Device::Cpu), DType::F32);
    }

    #[test]
    fn test_model_spec_respacing() {
        let config = GuidedDiffusionConfig::new(crate::config::SamplerKind::Ddim, 25, Device::Cpu)
            .with_checkpoint("uncondImageNet256")
            .with_fast(false);
        let spec = ModelSpec::from_config(&config).unwrap();
        assert_eq!(spec.diffusion.timestep_respacing, "ddim25");
        assert_eq!(spec.profile.image_size, 256);
        assert!(spec.secondary.is_none());
    }
}
