//! Depth-frame fusion into the voxel-hashed splat map
//!
//! A fusion pass has two halves. `DepthFusion::prepare` reads the frame,
//! unprojects accepted samples into world space and aggregates them per voxel;
//! it never touches the map. `FusionBatch::apply` then folds the aggregated
//! observations into a `SplatMap` and is the only part that needs the map lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec3};

use crate::config::FusionParams;
use crate::core::camera::pixel_to_ndc;
use crate::core::splat::VoxelKey;
use crate::core::store::{ObserveParams, Observation, SplatMap};
use crate::fusion::frame::{FrameError, SensorFrame};

/// Counters for one fusion pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    /// Pixels visited after stride subsampling
    pub sampled: usize,
    /// Samples rejected by the depth window (including missing readings)
    pub out_of_range: usize,
    /// Distinct voxels touched
    pub voxels: usize,
    pub inserted: usize,
    pub updated: usize,
    /// New voxels skipped because the store is full
    pub dropped: usize,
}

/// Result of handing a frame to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum FusionOutcome {
    /// The frame was fused into the map
    Fused(FusionStats),
    /// The frame arrived inside the minimum fusion interval and was ignored
    RateLimited,
    /// The frame was malformed; the map is unchanged
    Rejected(FrameError),
    /// The map was replaced or realigned while the batch was prepared
    Discarded,
}

impl FusionOutcome {
    pub fn is_fused(&self) -> bool {
        matches!(self, FusionOutcome::Fused(_))
    }

    pub fn stats(&self) -> Option<&FusionStats> {
        match self {
            FusionOutcome::Fused(stats) => Some(stats),
            _ => None,
        }
    }
}

/// Wall-clock throttle between fusion passes
#[derive(Debug, Clone)]
pub struct RateGate {
    min_interval: Duration,
    last_fused: Option<Instant>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_fused: None,
        }
    }

    /// Whether a pass may start at `now`
    pub fn is_open(&self, now: Instant) -> bool {
        if self.min_interval.is_zero() {
            return true;
        }
        match self.last_fused {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
            None => true,
        }
    }

    /// Record a completed pass
    pub fn mark(&mut self, now: Instant) {
        self.last_fused = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_fused = None;
    }
}

/// Samples landing in one voxel during a pass
#[derive(Debug, Clone, Copy)]
struct VoxelAccumulator {
    key: VoxelKey,
    sum: Vec3,
    count: u32,
    color: [f32; 3],
}

impl VoxelAccumulator {
    fn mean(&self) -> Vec3 {
        self.sum / self.count as f32
    }
}

/// Per-voxel observations of one frame, ready to apply
#[derive(Debug, Clone, Default)]
pub struct FusionBatch {
    cells: Vec<VoxelAccumulator>,
    sampled: usize,
    out_of_range: usize,
}

impl FusionBatch {
    /// Number of distinct voxels touched
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Voxels and their mean positions, in first-seen order
    pub fn observations(&self) -> impl Iterator<Item = (VoxelKey, Vec3)> + '_ {
        self.cells.iter().map(|cell| (cell.key, cell.mean()))
    }

    /// Fold the batch into `map`. Each voxel is observed exactly once.
    pub fn apply(&self, map: &mut SplatMap, params: &ObserveParams) -> FusionStats {
        let mut stats = FusionStats {
            sampled: self.sampled,
            out_of_range: self.out_of_range,
            voxels: self.cells.len(),
            ..Default::default()
        };

        for cell in &self.cells {
            match map.observe(cell.key, cell.mean(), cell.color, params) {
                Observation::Updated(_) => stats.updated += 1,
                Observation::Inserted(_) => stats.inserted += 1,
                Observation::Dropped => stats.dropped += 1,
            }
        }
        stats
    }
}

/// Turns sensor frames into voxel observations
#[derive(Debug, Clone)]
pub struct DepthFusion {
    params: FusionParams,
    voxel_size: f32,
}

impl DepthFusion {
    pub fn new(params: FusionParams, voxel_size: f32) -> Self {
        Self { params, voxel_size }
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    pub fn observe_params(&self) -> ObserveParams {
        self.params.observe_params(self.voxel_size)
    }

    #[inline]
    fn in_window(&self, depth: f32) -> bool {
        depth > 0.0 && depth >= self.params.min_depth && depth <= self.params.max_depth
    }

    /// Validate `frame`, unproject its accepted samples through
    /// `inverse(view * anchor)` and aggregate them per voxel.
    pub fn prepare(&self, frame: &SensorFrame<'_>, anchor: &Mat4) -> Result<FusionBatch, FrameError> {
        frame.validate()?;

        let effective_view = frame.view * *anchor;
        let camera_to_world = effective_view.inverse();
        if !camera_to_world.is_finite() {
            return Err(FrameError::InvalidPose);
        }

        let depth = &frame.depth;
        let (width, height) = (depth.width, depth.height);
        let stride = self.params.stride.max(1);

        let mut batch = FusionBatch::default();
        let mut slots: HashMap<VoxelKey, usize> = HashMap::new();

        for y in (0..height).step_by(stride) {
            for x in (0..width).step_by(stride) {
                batch.sampled += 1;
                let d = depth.samples.meters(y * width + x);
                if !self.in_window(d) {
                    batch.out_of_range += 1;
                    continue;
                }

                let (ndc_x, ndc_y) = pixel_to_ndc(x, y, width, height);
                let camera_point = frame.projection.unproject(ndc_x, ndc_y, d);
                let world = camera_to_world.transform_point3(camera_point);
                if !world.is_finite() {
                    batch.out_of_range += 1;
                    continue;
                }

                let key = VoxelKey::from_position(world, self.voxel_size);
                match slots.get(&key) {
                    Some(&i) => {
                        let cell = &mut batch.cells[i];
                        cell.sum += world;
                        cell.count += 1;
                    }
                    None => {
                        let color = frame
                            .color
                            .as_ref()
                            .and_then(|c| c.sample(x, y, width))
                            .unwrap_or(self.params.fallback_color);
                        slots.insert(key, batch.cells.len());
                        batch.cells.push(VoxelAccumulator {
                            key,
                            sum: world,
                            count: 1,
                            color,
                        });
                    }
                }
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::camera::Projection;
    use crate::fusion::frame::{ChannelOrder, ColorImage, DepthImage};

    fn fusion(stride: usize) -> DepthFusion {
        let params = FusionParams {
            stride,
            min_depth: 0.2,
            max_depth: 4.0,
            ..Default::default()
        };
        DepthFusion::new(params, 0.01)
    }

    /// Narrow projection whose rays for a 1 m wall stay inside one 1 cm voxel
    fn narrow_projection() -> Projection {
        Projection::new(1000.0, 1000.0, 1.0, 1.0)
    }

    #[test]
    fn test_uniform_frame_collapses_to_one_voxel() {
        let depth = vec![1.0f32; 100 * 100];
        let frame = SensorFrame::new(DepthImage::meters(&depth, 100, 100), Mat4::IDENTITY, narrow_projection());
        let fusion = fusion(1);

        let batch = fusion.prepare(&frame, &Mat4::IDENTITY).unwrap();
        assert_eq!(batch.len(), 1);

        let mut map = SplatMap::new(0.01, 1000);
        let stats = batch.apply(&mut map, &fusion.observe_params());
        assert_eq!(stats.sampled, 10_000);
        assert_eq!(stats.inserted, 1);
        assert_eq!(map.len(), 1);

        let record = &map.records()[0];
        assert!((record.confidence - 0.15).abs() < 1e-6);
        assert!(record.position().distance(Vec3::new(0.001, 0.001, -1.0)) < 0.01);
        assert_eq!(record.color, [0.0, 0.8, 1.0]);
    }

    #[test]
    fn test_depth_window_filters_samples() {
        // Alternating near, far and valid samples
        let depth: Vec<f32> = (0..64)
            .map(|i| match i % 3 {
                0 => 0.1,
                1 => 9.0,
                _ => 1.0,
            })
            .collect();
        let frame = SensorFrame::new(DepthImage::meters(&depth, 8, 8), Mat4::IDENTITY, Projection::default());
        let batch = fusion(1).prepare(&frame, &Mat4::IDENTITY).unwrap();

        let valid = depth.iter().filter(|&&d| d == 1.0).count();
        assert_eq!(batch.sampled, 64);
        assert_eq!(batch.out_of_range, 64 - valid);
        for (_, p) in batch.observations() {
            assert!((p.z + 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_missing_millimeter_readings_are_skipped() {
        let depth = vec![0u16; 16];
        let frame = SensorFrame::new(DepthImage::millimeters(&depth, 4, 4), Mat4::IDENTITY, Projection::default());
        let batch = fusion(1).prepare(&frame, &Mat4::IDENTITY).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.out_of_range, 16);
    }

    #[test]
    fn test_stride_subsamples() {
        let depth = vec![1.0f32; 16 * 16];
        let frame = SensorFrame::new(DepthImage::meters(&depth, 16, 16), Mat4::IDENTITY, Projection::default());
        let batch = fusion(4).prepare(&frame, &Mat4::IDENTITY).unwrap();
        assert_eq!(batch.sampled, 16);
    }

    #[test]
    fn test_anchor_moves_world_points() {
        let depth = vec![1.0f32; 4];
        let frame = SensorFrame::new(DepthImage::meters(&depth, 2, 2), Mat4::IDENTITY, narrow_projection());
        // Camera sits 2 m along +X in map coordinates
        let anchor = Mat4::from_translation(Vec3::new(-2.0, 0.0, 0.0));
        let batch = fusion(1).prepare(&frame, &anchor).unwrap();

        let (_, p) = batch.observations().next().unwrap();
        assert!((p.x - 2.0).abs() < 0.01);
        assert!((p.z + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_first_color_wins_per_voxel() {
        let depth = vec![1.0f32; 2];
        let color = [200u8, 10, 10, 10, 200, 10];
        let frame = SensorFrame::new(DepthImage::meters(&depth, 2, 1), Mat4::IDENTITY, narrow_projection())
            .with_color(ColorImage::new(&color, 2, 1, ChannelOrder::Rgb));

        let fusion = fusion(1);
        let batch = fusion.prepare(&frame, &Mat4::IDENTITY).unwrap();
        assert_eq!(batch.len(), 1);

        let mut map = SplatMap::new(0.01, 10);
        batch.apply(&mut map, &fusion.observe_params());
        assert_eq!(map.records()[0].color, [200.0 / 255.0, 10.0 / 255.0, 10.0 / 255.0]);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let depth = vec![1.0f32; 3];
        let frame = SensorFrame::new(DepthImage::meters(&depth, 2, 2), Mat4::IDENTITY, Projection::default());
        assert!(matches!(
            fusion(1).prepare(&frame, &Mat4::IDENTITY),
            Err(FrameError::DepthLength { .. })
        ));
    }

    #[test]
    fn test_rate_gate() {
        let start = Instant::now();
        let mut gate = RateGate::new(Duration::from_millis(100));
        assert!(gate.is_open(start));
        gate.mark(start);
        assert!(!gate.is_open(start + Duration::from_millis(50)));
        assert!(gate.is_open(start + Duration::from_millis(100)));

        let disabled = RateGate::new(Duration::ZERO);
        assert!(disabled.is_open(start));
    }
}
