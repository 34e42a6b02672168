//! Splat records and voxel keys

use glam::Vec3;

/// Identity quaternion in `[w, x, y, z]` order
pub const IDENTITY_ROTATION: [f32; 4] = [1.0, 0.0, 0.0, 0.0];

/// A single point splat in map space.
///
/// `opacity` and `confidence` are kept equal: confidence is the accumulated
/// evidence that the voxel is occupied and doubles as render opacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatRecord {
    /// Position in meters
    pub position: [f32; 3],
    /// Uniform scale in meters
    pub scale: f32,
    /// RGB color in [0, 1]
    pub color: [f32; 3],
    /// Render opacity in [0, 1]
    pub opacity: f32,
    /// Accumulated confidence in [0, 1]
    pub confidence: f32,
    /// Orientation quaternion `[w, x, y, z]`
    pub rotation: [f32; 4],
}

impl SplatRecord {
    /// Create a freshly observed splat
    pub fn new(position: Vec3, scale: f32, color: [f32; 3], confidence: f32) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            position: position.to_array(),
            scale,
            color,
            opacity: confidence,
            confidence,
            rotation: IDENTITY_ROTATION,
        }
    }

    /// Position as a glam vector
    #[inline]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    /// Raise confidence by `step`, capped at 1.0. Opacity follows.
    pub fn reinforce(&mut self, step: f32) {
        self.confidence = (self.confidence + step.max(0.0)).min(1.0);
        self.opacity = self.confidence;
    }

    /// Move the position toward `observed` by `weight` (exponential moving average)
    pub fn blend_position(&mut self, observed: Vec3, weight: f32) {
        let blended = self.position().lerp(observed, weight.clamp(0.0, 1.0));
        self.position = blended.to_array();
    }
}

/// Integer voxel coordinate: `floor(position / voxel_size)` per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelKey {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Quantize a position. Coordinates beyond the `i32` range saturate.
    pub fn from_position(position: Vec3, voxel_size: f32) -> Self {
        let cell = (position / voxel_size).floor();
        Self {
            x: cell.x as i32,
            y: cell.y as i32,
            z: cell.z as i32,
        }
    }

    /// Minimum corner of the voxel in world units
    pub fn min_corner(&self, voxel_size: f32) -> Vec3 {
        Vec3::new(self.x as f32, self.y as f32, self.z as f32) * voxel_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voxel_key_floor() {
        let key = VoxelKey::from_position(Vec3::new(0.015, -0.001, -0.02), 0.01);
        assert_eq!(key, VoxelKey::new(1, -1, -2));
    }

    #[test]
    fn test_voxel_key_contains_position() {
        let voxel = 0.02;
        let p = Vec3::new(-3.31, 0.07, 12.5);
        let key = VoxelKey::from_position(p, voxel);
        let min = key.min_corner(voxel);
        assert!(p.x >= min.x - 1e-5 && p.x < min.x + voxel + 1e-5);
        assert!(p.y >= min.y - 1e-5 && p.y < min.y + voxel + 1e-5);
        assert!(p.z >= min.z - 1e-5 && p.z < min.z + voxel + 1e-5);
    }

    #[test]
    fn test_reinforce_caps_at_one() {
        let mut splat = SplatRecord::new(Vec3::ZERO, 0.01, [1.0, 1.0, 1.0], 0.9);
        splat.reinforce(0.15);
        assert_eq!(splat.confidence, 1.0);
        assert_eq!(splat.opacity, splat.confidence);
    }

    #[test]
    fn test_blend_position() {
        let mut splat = SplatRecord::new(Vec3::ZERO, 0.01, [0.0; 3], 0.1);
        splat.blend_position(Vec3::new(1.0, 0.0, 0.0), 0.1);
        assert!((splat.position[0] - 0.1).abs() < 1e-6);
    }
}
