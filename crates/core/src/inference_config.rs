use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::variant::ModelVariant;

pub const SYNC_GAP_RANGE: std::ops::RangeInclusive<i32> = 0..=3;
pub const CPU_DEVICE: i32 = -1;

/// Unchecked inference settings as supplied by a caller or config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub variant: ModelVariant,
    pub scale: i32,
    pub denoise: i32,
    pub sync_gap: i32,
    pub device: i32,
    pub augment: bool,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            variant: ModelVariant::Se,
            scale: 2,
            denoise: -1,
            sync_gap: 3,
            device: 0,
            augment: false,
        }
    }
}

impl InferenceSettings {
    /// Checks, in order: sync gap, device, scale, denoise. The first
    /// violation is reported.
    pub fn validate(self) -> Result<InferenceConfig, ConfigError> {
        if !SYNC_GAP_RANGE.contains(&self.sync_gap) {
            return Err(ConfigError::SyncGapOutOfRange {
                value: self.sync_gap,
            });
        }
        if self.device < CPU_DEVICE {
            return Err(ConfigError::DeviceOutOfRange { value: self.device });
        }

        let scales = self.variant.allowed_scales();
        if !scales.contains(&self.scale) {
            return Err(ConfigError::ScaleNotAllowed {
                variant: self.variant,
                value: self.scale,
                min: *scales.start(),
                max: *scales.end(),
            });
        }

        let denoise = self.variant.allowed_denoise();
        if !denoise.contains(&self.denoise) {
            return Err(ConfigError::DenoiseNotAllowed {
                variant: self.variant,
                value: self.denoise,
                allowed: denoise,
            });
        }

        Ok(InferenceConfig { settings: self })
    }
}

/// Validated inference configuration. Only obtainable through
/// [`InferenceSettings::validate`] (or deserialization, which validates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InferenceSettings", into = "InferenceSettings")]
pub struct InferenceConfig {
    settings: InferenceSettings,
}

impl InferenceConfig {
    pub fn new(
        variant: ModelVariant,
        scale: i32,
        denoise: i32,
        sync_gap: i32,
        device: i32,
        augment: bool,
    ) -> Result<Self, ConfigError> {
        InferenceSettings {
            variant,
            scale,
            denoise,
            sync_gap,
            device,
            augment,
        }
        .validate()
    }

    pub fn variant(&self) -> ModelVariant {
        self.settings.variant
    }

    pub fn scale(&self) -> i32 {
        self.settings.scale
    }

    pub fn denoise(&self) -> i32 {
        self.settings.denoise
    }

    pub fn sync_gap(&self) -> i32 {
        self.settings.sync_gap
    }

    pub fn device(&self) -> i32 {
        self.settings.device
    }

    pub fn augment(&self) -> bool {
        self.settings.augment
    }

    pub fn settings(&self) -> InferenceSettings {
        self.settings
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            settings: InferenceSettings::default(),
        }
    }
}

impl TryFrom<InferenceSettings> for InferenceConfig {
    type Error = ConfigError;

    fn try_from(settings: InferenceSettings) -> Result<Self, Self::Error> {
        settings.validate()
    }
}

impl From<InferenceConfig> for InferenceSettings {
    fn from(config: InferenceConfig) -> Self {
        config.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(variant: ModelVariant, scale: i32, denoise: i32) -> InferenceSettings {
        InferenceSettings {
            variant,
            scale,
            denoise,
            ..Default::default()
        }
    }

    #[test]
    fn default_settings_are_valid() {
        let config = InferenceSettings::default().validate().unwrap();
        assert_eq!(config.variant(), ModelVariant::Se);
        assert_eq!(config.scale(), 2);
        assert_eq!(config.denoise(), -1);
        assert_eq!(config.sync_gap(), 3);
        assert_eq!(config.device(), 0);
        assert!(!config.augment());
        assert_eq!(config, InferenceConfig::default());
    }

    #[test]
    fn sync_gap_bounds_are_inclusive() {
        for gap in [0, 3] {
            let s = InferenceSettings {
                sync_gap: gap,
                ..Default::default()
            };
            assert!(s.validate().is_ok(), "sync_gap {gap} should be accepted");
        }
        for gap in [-1, 4] {
            let s = InferenceSettings {
                sync_gap: gap,
                ..Default::default()
            };
            assert_eq!(
                s.validate().unwrap_err(),
                ConfigError::SyncGapOutOfRange { value: gap }
            );
        }
    }

    #[test]
    fn device_lower_bound() {
        for device in [-1, 0, 3] {
            let s = InferenceSettings {
                device,
                ..Default::default()
            };
            assert!(s.validate().is_ok(), "device {device} should be accepted");
        }
        let s = InferenceSettings {
            device: -2,
            ..Default::default()
        };
        assert_eq!(
            s.validate().unwrap_err(),
            ConfigError::DeviceOutOfRange { value: -2 }
        );
    }

    #[test]
    fn nose_combinations() {
        assert!(settings(ModelVariant::Nose, 2, 0).validate().is_ok());
        assert!(matches!(
            settings(ModelVariant::Nose, 3, 0).validate(),
            Err(ConfigError::ScaleNotAllowed { value: 3, min: 2, max: 2, .. })
        ));
        assert!(matches!(
            settings(ModelVariant::Nose, 2, -1).validate(),
            Err(ConfigError::DenoiseNotAllowed { value: -1, .. })
        ));
    }

    #[test]
    fn pro_combinations() {
        for (scale, denoise) in [(2, -1), (3, 0), (2, 3)] {
            assert!(settings(ModelVariant::Pro, scale, denoise).validate().is_ok());
        }
        assert!(matches!(
            settings(ModelVariant::Pro, 2, 1).validate(),
            Err(ConfigError::DenoiseNotAllowed { value: 1, .. })
        ));
        assert!(matches!(
            settings(ModelVariant::Pro, 4, 0).validate(),
            Err(ConfigError::ScaleNotAllowed { value: 4, .. })
        ));
    }

    #[test]
    fn se_combinations() {
        for (scale, denoise) in [(2, -1), (4, 0), (3, 3)] {
            assert!(settings(ModelVariant::Se, scale, denoise).validate().is_ok());
        }
        assert!(matches!(
            settings(ModelVariant::Se, 2, 4).validate(),
            Err(ConfigError::DenoiseNotAllowed { value: 4, .. })
        ));
        assert!(matches!(
            settings(ModelVariant::Se, 5, 0).validate(),
            Err(ConfigError::ScaleNotAllowed { value: 5, .. })
        ));
    }

    #[test]
    fn validation_matches_catalog_membership_exhaustively() {
        for variant in ModelVariant::ALL {
            for scale in 0..=6 {
                for denoise in -3..=5 {
                    let expected = variant.allowed_scales().contains(&scale)
                        && variant.allowed_denoise().contains(&denoise);
                    let actual = settings(variant, scale, denoise).validate().is_ok();
                    assert_eq!(expected, actual, "{variant} scale={scale} denoise={denoise}");
                }
            }
        }
    }

    #[test]
    fn first_violation_wins_in_fixed_order() {
        let everything_wrong = InferenceSettings {
            variant: ModelVariant::Nose,
            scale: 9,
            denoise: 9,
            sync_gap: 9,
            device: -9,
            augment: false,
        };
        assert_eq!(
            everything_wrong.validate().unwrap_err(),
            ConfigError::SyncGapOutOfRange { value: 9 }
        );

        let device_scale_denoise = InferenceSettings {
            sync_gap: 0,
            ..everything_wrong
        };
        assert_eq!(
            device_scale_denoise.validate().unwrap_err(),
            ConfigError::DeviceOutOfRange { value: -9 }
        );

        let scale_denoise = InferenceSettings {
            device: 0,
            ..device_scale_denoise
        };
        assert!(matches!(
            scale_denoise.validate().unwrap_err(),
            ConfigError::ScaleNotAllowed { value: 9, .. }
        ));
    }

    #[test]
    fn deserialization_validates() {
        let ok: InferenceConfig =
            toml::from_str("variant = \"pro\"\nscale = 3\ndenoise = 0\n").unwrap();
        assert_eq!(ok.variant(), ModelVariant::Pro);
        assert_eq!(ok.scale(), 3);
        assert_eq!(ok.sync_gap(), 3);

        let err = toml::from_str::<InferenceConfig>("variant = \"nose\"\nscale = 3\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("scale"), "unexpected error: {err}");
    }

    #[test]
    fn toml_roundtrip_preserves_config() {
        let config = InferenceConfig::new(ModelVariant::Se, 4, 3, 1, -1, true).unwrap();
        let encoded = toml::to_string(&config).unwrap();
        let decoded: InferenceConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.device(), CPU_DEVICE);
    }
}
