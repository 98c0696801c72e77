//! Error types for the caller-facing upscaling API.
//!
//! Component errors ([`ConfigError`], [`AssetError`], [`BufferSizeError`])
//! convert into [`Error`] so `?` propagates across module boundaries.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::variant::ModelVariant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sync_gap must be within 0..=3, got {value}")]
    SyncGapOutOfRange { value: i32 },

    #[error("device must be >= -1 (-1 selects CPU), got {value}")]
    DeviceOutOfRange { value: i32 },

    #[error("scale for {variant} must be within {min}..={max}, got {value}")]
    ScaleNotAllowed {
        variant: ModelVariant,
        value: i32,
        min: i32,
        max: i32,
    },

    #[error("denoise for {variant} must be one of {allowed:?}, got {value}")]
    DenoiseNotAllowed {
        variant: ModelVariant,
        value: i32,
        allowed: &'static [i32],
    },

    #[error("unknown model variant: {value}")]
    UnknownVariant { value: String },
}

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("bundled asset group '{group}' is missing or empty")]
    MissingGroup { group: String },

    #[error("failed to list bundled asset group '{group}'")]
    List {
        group: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read bundled asset '{group}/{name}'")]
    Read {
        group: String,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write model file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "unexpected pixel buffer size for {width}x{height}: got {actual} bytes, expected {expected_rgb} (RGB) or {expected_rgba} (RGBA)"
)]
pub struct BufferSizeError {
    pub width: u32,
    pub height: u32,
    pub actual: usize,
    pub expected_rgb: u64,
    pub expected_rgba: u64,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid inference configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("model asset materialization failed: {0}")]
    AssetMaterialization(#[from] AssetError),

    #[error("engine initialization failed with status {status}")]
    EngineInit { status: i64 },

    #[error("failed to decode input image")]
    Decode(#[source] image::ImageError),

    #[error("engine compute failed: {reason}")]
    EngineCompute { reason: String },

    #[error(transparent)]
    UnexpectedBufferSize(#[from] BufferSizeError),

    #[error("session has been released")]
    SessionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
