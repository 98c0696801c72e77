//! The native inference capability: `init`, `compute`, `dispose`.
//!
//! The orchestration layer never looks inside a handle; it only checks that
//! `init` produced a value >= 1 and passes it back verbatim.

pub mod dylib;
pub mod resample;

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

pub use dylib::DylibEngine;
pub use resample::ResampleEngine;

/// Status returned by `init` for an argument the engine rejects.
pub const STATUS_INVALID_ARGUMENT: i64 = -1;
/// Status returned by `init` when weight files are missing from the model dir.
pub const STATUS_MODEL_NOT_FOUND: i64 = -2;
/// Status returned by `init` for a device index the engine cannot use.
pub const STATUS_DEVICE_UNAVAILABLE: i64 = -3;

/// Opaque engine-side instance id. Always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineHandle(i64);

impl EngineHandle {
    /// Interprets an `init` return value.
    pub fn from_status(status: i64) -> Option<Self> {
        (status >= 1).then_some(Self(status))
    }

    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything `init` needs to load one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInitParams {
    pub model_root: PathBuf,
    /// Variant directory under `model_root`, e.g. `models-se`.
    pub model_dir: String,
    pub denoise: i32,
    pub scale: i32,
    pub sync_gap: i32,
    pub augment: bool,
    pub device: i32,
}

impl EngineInitParams {
    pub fn variant_path(&self) -> PathBuf {
        self.model_root.join(&self.model_dir)
    }
}

pub trait InferenceEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Loads a model. Returns a handle (>= 1) or an engine status code.
    fn init(&self, params: &EngineInitParams) -> i64;

    /// Upscales one compressed image (PNG/JPEG/WebP) and returns packed
    /// 3- or 4-channel pixels of `src * scale` dimensions.
    fn compute(&self, handle: EngineHandle, image: &[u8]) -> Result<Vec<u8>>;

    /// Frees the instance behind `handle`. Called at most once per handle.
    fn dispose(&self, handle: EngineHandle);

    /// Whether concurrent `compute` calls on one handle are safe.
    fn is_reentrant(&self) -> bool {
        false
    }
}
