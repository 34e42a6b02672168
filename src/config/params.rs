//! Parameter structures for engine components

use serde::{Deserialize, Serialize};

use crate::core::store::ObserveParams;

/// Splat map storage parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapParams {
    /// Voxel edge length in meters
    pub voxel_size: f32,
    /// Hard cap on the number of splats
    pub max_splats: usize,
}

impl Default for MapParams {
    fn default() -> Self {
        Self {
            voxel_size: 0.01,
            max_splats: 65_536,
        }
    }
}

/// Depth fusion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    /// Pixel subsampling stride
    pub stride: usize,
    /// Nearest accepted depth (meters)
    pub min_depth: f32,
    /// Farthest accepted depth (meters)
    pub max_depth: f32,
    /// Confidence gained per observation
    pub confidence_increment: f32,
    /// EMA weight toward a new observation
    pub position_blend: f32,
    /// New splat scale as a multiple of the voxel size
    pub scale_factor: f32,
    /// Color used when a frame carries no color image
    pub fallback_color: [f32; 3],
    /// Minimum wall-clock gap between fusion passes (0 disables)
    pub min_interval_ms: u64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            stride: 8,
            min_depth: 0.2,
            max_depth: 4.0,
            confidence_increment: 0.15,
            position_blend: 0.1,
            scale_factor: 1.8,
            fallback_color: [0.0, 0.8, 1.0],
            min_interval_ms: 100,
        }
    }
}

impl FusionParams {
    pub fn observe_params(&self, voxel_size: f32) -> ObserveParams {
        ObserveParams {
            confidence_increment: self.confidence_increment,
            position_blend: self.position_blend,
            splat_scale: self.scale_factor * voxel_size,
        }
    }
}

/// Background sorter parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterParams {
    /// Wake-up interval when no sort is requested
    pub poll_interval_ms: u64,
    /// Camera translation (meters) that forces a resort of an unchanged map
    pub resort_translation: f32,
    /// Cosine between old and new forward axes below which an unchanged map is resorted
    pub resort_min_cos: f32,
    /// Snapshot size above which sorting runs in parallel
    pub parallel_threshold: usize,
}

impl Default for SorterParams {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            resort_translation: 0.05,
            resort_min_cos: 0.99,
            parallel_threshold: 16_384,
        }
    }
}

/// Render hand-off parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderParams {
    /// Splats with lower opacity are left out of the render buffer
    pub min_opacity: f32,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self { min_opacity: 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_params_scale() {
        let params = FusionParams::default();
        let observe = params.observe_params(0.01);
        assert!((observe.splat_scale - 0.018).abs() < 1e-6);
        assert_eq!(observe.confidence_increment, 0.15);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let params: FusionParams = toml::from_str("stride = 2").unwrap();
        assert_eq!(params.stride, 2);
        assert_eq!(params.min_interval_ms, 100);
    }
}
