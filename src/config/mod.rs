//! Configuration module
//!
//! Engine configuration with YAML/TOML loading and named presets.

pub mod config;
pub mod params;

pub use config::{ConfigError, ConfigLoader, EngineConfig};
pub use params::{FusionParams, MapParams, RenderParams, SorterParams};
