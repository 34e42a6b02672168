//! Engine configuration and file loading

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use super::params::*;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub map: MapParams,
    pub fusion: FusionParams,
    pub sorter: SorterParams,
    pub render: RenderParams,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl EngineConfig {
    /// Fine voxels, dense sampling, slow confidence growth
    pub fn dense() -> Self {
        Self {
            map: MapParams {
                voxel_size: 0.005,
                max_splats: 65_536,
            },
            fusion: FusionParams {
                stride: 2,
                confidence_increment: 0.05,
                min_interval_ms: 33,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Coarse voxels, sparse sampling, sticky confidence
    pub fn sparse() -> Self {
        Self {
            map: MapParams {
                voxel_size: 0.01,
                max_splats: 65_536,
            },
            fusion: FusionParams {
                stride: 8,
                confidence_increment: 0.15,
                min_interval_ms: 100,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let map = &self.map;
        if !(map.voxel_size.is_finite() && map.voxel_size > 0.0) {
            return Err(invalid("map.voxel_size", format!("must be positive, got {}", map.voxel_size)));
        }
        if map.max_splats == 0 || map.max_splats > i32::MAX as usize {
            return Err(invalid("map.max_splats", format!("must be in 1..={}", i32::MAX)));
        }

        let fusion = &self.fusion;
        if fusion.stride == 0 {
            return Err(invalid("fusion.stride", "must be at least 1"));
        }
        if !(fusion.min_depth.is_finite() && fusion.max_depth.is_finite())
            || fusion.min_depth < 0.0
            || fusion.min_depth >= fusion.max_depth
        {
            return Err(invalid(
                "fusion.min_depth",
                format!("window [{}, {}] is empty", fusion.min_depth, fusion.max_depth),
            ));
        }
        if !(fusion.confidence_increment > 0.0 && fusion.confidence_increment <= 1.0) {
            return Err(invalid("fusion.confidence_increment", "must be in (0, 1]"));
        }
        if !(fusion.position_blend > 0.0 && fusion.position_blend <= 1.0) {
            return Err(invalid("fusion.position_blend", "must be in (0, 1]"));
        }
        if !(fusion.scale_factor.is_finite() && fusion.scale_factor > 0.0) {
            return Err(invalid("fusion.scale_factor", "must be positive"));
        }

        if self.sorter.poll_interval_ms == 0 {
            return Err(invalid("sorter.poll_interval_ms", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.render.min_opacity) {
            return Err(invalid("render.min_opacity", "must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Configuration loader supporting YAML and TOML
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file, choosing the parser by extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let extension = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        let config = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => Self::load_yaml(path)?,
            "toml" => Self::load_toml(path)?,
            _ => return Err(ConfigError::UnsupportedFormat(extension.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_yaml<P: AsRef<Path>>(config: &EngineConfig, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn save_toml<P: AsRef<Path>>(config: &EngineConfig, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
