//! Asynchronous orchestration for Real-CUGAN super-resolution.
//!
//! Validate an [`InferenceConfig`], create an [`InferenceSession`] through an
//! [`Upscaler`], `process` images concurrently and `release` the session when
//! done.

pub mod assembler;
pub mod assets;
pub mod config;
pub mod engine;
pub mod error;
pub mod inference_config;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod variant;

pub use assembler::CanonicalImage;
pub use assets::{AssetSource, DirAssetSource, MemoryAssetSource};
pub use engine::{EngineHandle, InferenceEngine};
pub use error::{Error, Result};
pub use inference_config::{InferenceConfig, InferenceSettings};
pub use scheduler::{ComputeConfig, ComputeScheduler};
pub use session::{InferenceSession, Upscaler};
pub use variant::ModelVariant;
