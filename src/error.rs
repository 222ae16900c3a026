//! Crate-level error type

use crate::config::ConfigError;
use crate::loader::LoaderError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Fast guidance needs a secondary model, but none was loaded")]
    MissingSecondary,

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
