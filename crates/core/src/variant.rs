//! Built-in Real-CUGAN model presets.
//!
//! Each variant maps to one directory of bundled weights and declares which
//! scale factors and denoise levels its weights were trained for.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Serialized as the lowercase short name; deserialization goes through
/// [`FromStr`], so config files accept the directory name as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ModelVariant {
    Nose,
    Pro,
    Se,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 3] = [Self::Nose, Self::Pro, Self::Se];

    /// Directory holding this variant's weights, relative to the model root.
    pub fn dir(self) -> &'static str {
        match self {
            Self::Nose => "models-nose",
            Self::Pro => "models-pro",
            Self::Se => "models-se",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nose => "NOSE",
            Self::Pro => "PRO",
            Self::Se => "SE",
        }
    }

    pub fn allowed_scales(self) -> RangeInclusive<i32> {
        match self {
            Self::Nose => 2..=2,
            Self::Pro => 2..=3,
            Self::Se => 2..=4,
        }
    }

    pub fn allowed_denoise(self) -> &'static [i32] {
        match self {
            Self::Nose => &[0],
            Self::Pro => &[-1, 0, 3],
            Self::Se => &[-1, 0, 1, 2, 3],
        }
    }

    /// NOSE weights have no SE-sync stage, so the engine always runs them with
    /// a sync gap of 0.
    pub fn effective_sync_gap(self, sync_gap: i32) -> i32 {
        match self {
            Self::Nose => 0,
            Self::Pro | Self::Se => sync_gap,
        }
    }

    /// File stem of the weights for one `(scale, denoise)` pair, e.g.
    /// `up2x-conservative`. The engine loads `<stem>.param` and `<stem>.bin`.
    pub fn weight_stem(scale: i32, denoise: i32) -> String {
        match denoise {
            -1 => format!("up{scale}x-conservative"),
            0 => format!("up{scale}x-no-denoise"),
            n => format!("up{scale}x-denoise{n}x"),
        }
    }

    pub fn weight_files(scale: i32, denoise: i32) -> (String, String) {
        let stem = Self::weight_stem(scale, denoise);
        (format!("{stem}.param"), format!("{stem}.bin"))
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelVariant {
    type Err = ConfigError;

    /// Accepts either the directory name (`models-se`) or the short name
    /// (`se`, case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.dir() == needle || v.name().eq_ignore_ascii_case(&needle))
            .ok_or_else(|| ConfigError::UnknownVariant {
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for ModelVariant {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantInfo {
    pub name: &'static str,
    pub dir: &'static str,
    pub min_scale: i32,
    pub max_scale: i32,
    pub denoise: &'static [i32],
}

impl From<ModelVariant> for VariantInfo {
    fn from(variant: ModelVariant) -> Self {
        let scales = variant.allowed_scales();
        Self {
            name: variant.name(),
            dir: variant.dir(),
            min_scale: *scales.start(),
            max_scale: *scales.end(),
            denoise: variant.allowed_denoise(),
        }
    }
}

pub fn catalog() -> Vec<VariantInfo> {
    ModelVariant::ALL.into_iter().map(VariantInfo::from).collect()
}

pub fn catalog_json() -> Result<String> {
    serde_json::to_string_pretty(&catalog()).context("Failed to serialize variant catalog")
}
