//! Splat map engine
//!
//! Owns the map, the background sorter and the render cache, and is the
//! single entry point for the capture, render and persistence collaborators.
//!
//! Locks:
//! - the data lock (`SharedMap`) guards the map, camera, anchor and counters;
//! - the sort buffer lock is owned by the sorter and never held with the data lock;
//! - the fusion gate serializes fusion passes and is always taken before the data lock;
//! - the render cache lock serializes render callers and is taken before the data lock.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Mat4;
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::core::camera::{camera_position, is_valid_view, Projection};
use crate::core::splat::SplatRecord;
use crate::core::store::SplatMap;
use crate::fusion::depth_fusion::{DepthFusion, FusionOutcome, RateGate};
use crate::fusion::frame::{FrameError, SensorFrame};
use crate::io::map_file::{read_map, write_map, MapFileError, MapSummary};
use crate::pipeline::sorter::{BackgroundSorter, SortOrder, SortSnapshot, SortSource, SortStamp};
use crate::render::bridge::{LightEstimate, RenderCache, RenderFrame};

/// Rejected anchor transforms
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorError {
    #[error("anchor transform contains non-finite values")]
    NonFinite,
    #[error("anchor transform is not invertible")]
    Singular,
}

#[derive(Debug, Clone, Copy)]
struct CameraState {
    view: Mat4,
    projection: Projection,
}

struct MapState {
    map: SplatMap,
    camera: Option<CameraState>,
    anchor: Mat4,
    /// Bumped whenever the anchor or the whole store is replaced
    generation: u64,
    /// Store lifetime; bumped on clear and load
    epoch: u64,
    /// Bumped on every change that affects rendering
    version: u64,
    light: LightEstimate,
}

/// Data-lock side of the engine, shared with the sorter thread
pub struct SharedMap {
    state: Mutex<MapState>,
}

impl SharedMap {
    fn new(map: SplatMap) -> Self {
        Self {
            state: Mutex::new(MapState {
                map,
                camera: None,
                anchor: Mat4::IDENTITY,
                generation: 0,
                epoch: 0,
                version: 0,
                light: LightEstimate::default(),
            }),
        }
    }
}

impl SortSource for SharedMap {
    fn stamp(&self) -> Option<SortStamp> {
        let state = self.state.lock();
        let camera = state.camera?;
        Some(SortStamp {
            epoch: state.epoch,
            version: state.version,
            view: camera.view * state.anchor,
            splat_count: state.map.len(),
        })
    }

    fn snapshot(&self) -> Option<SortSnapshot> {
        let state = self.state.lock();
        let camera = state.camera?;
        Some(SortSnapshot {
            stamp: SortStamp {
                epoch: state.epoch,
                version: state.version,
                view: camera.view * state.anchor,
                splat_count: state.map.len(),
            },
            positions: state.map.store().positions(),
        })
    }
}

/// Incremental splat mapping engine
pub struct SplatEngine {
    config: EngineConfig,
    shared: Arc<SharedMap>,
    fusion: DepthFusion,
    fusion_gate: Mutex<RateGate>,
    render_cache: Mutex<RenderCache>,
    sorter: BackgroundSorter,
}

impl SplatEngine {
    /// Validate `config` and start the engine with an empty map
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let map = SplatMap::new(config.map.voxel_size, config.map.max_splats);
        let shared = Arc::new(SharedMap::new(map));
        let sorter = BackgroundSorter::spawn(Arc::clone(&shared), config.sorter.clone());
        let fusion = DepthFusion::new(config.fusion.clone(), config.map.voxel_size);
        let gate = RateGate::new(Duration::from_millis(config.fusion.min_interval_ms));

        info!(
            "Splat engine started: voxel {:.4} m, capacity {}, stride {}",
            config.map.voxel_size, config.map.max_splats, config.fusion.stride
        );

        Ok(Self {
            config,
            shared,
            fusion,
            fusion_gate: Mutex::new(gate),
            render_cache: Mutex::new(RenderCache::new()),
            sorter,
        })
    }

    pub fn builder() -> SplatEngineBuilder {
        SplatEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fuse one sensor frame into the map
    pub fn process_depth_frame(&self, frame: &SensorFrame<'_>) -> FusionOutcome {
        let mut gate = self.fusion_gate.lock();
        let now = Instant::now();
        if !gate.is_open(now) {
            return FusionOutcome::RateLimited;
        }

        let (anchor, generation) = {
            let state = self.shared.state.lock();
            (state.anchor, state.generation)
        };

        let batch = match self.fusion.prepare(frame, &anchor) {
            Ok(batch) => batch,
            Err(err) => {
                warn!("Rejected depth frame: {}", err);
                return FusionOutcome::Rejected(err);
            }
        };

        let stats = {
            let mut state = self.shared.state.lock();
            if state.generation != generation {
                warn!("Discarding fusion batch of {} voxels: map was replaced or realigned", batch.len());
                return FusionOutcome::Discarded;
            }
            let stats = batch.apply(&mut state.map, &self.fusion.observe_params());
            if stats.inserted + stats.updated > 0 {
                state.version += 1;
            }
            stats
        };

        gate.mark(now);
        drop(gate);
        self.sorter.request_sort();

        debug!(
            "Fused frame: {} samples, {} out of range, {} inserted, {} updated, {} dropped",
            stats.sampled, stats.out_of_range, stats.inserted, stats.updated, stats.dropped
        );
        if stats.dropped > 0 {
            debug!("Splat capacity {} reached", self.config.map.max_splats);
        }
        FusionOutcome::Fused(stats)
    }

    /// Set the camera used for sorting and rendering
    pub fn update_camera(&self, view: Mat4, projection: Projection) -> Result<(), FrameError> {
        if !is_valid_view(&view) {
            warn!("Ignoring camera update with invalid view matrix");
            return Err(FrameError::InvalidPose);
        }
        if !projection.is_valid() {
            warn!("Ignoring camera update with invalid projection");
            return Err(FrameError::InvalidProjection);
        }

        self.shared.state.lock().camera = Some(CameraState { view, projection });
        self.sorter.request_sort();
        Ok(())
    }

    /// Replace the anchor transform applied on top of every view
    pub fn align_map(&self, anchor: Mat4) -> Result<(), AnchorError> {
        if !anchor.is_finite() {
            return Err(AnchorError::NonFinite);
        }
        if !is_valid_view(&anchor) {
            return Err(AnchorError::Singular);
        }

        {
            let mut state = self.shared.state.lock();
            state.anchor = anchor;
            state.generation += 1;
            state.version += 1;
        }
        self.sorter.request_sort();
        debug!("Map realigned");
        Ok(())
    }

    pub fn anchor(&self) -> Mat4 {
        self.shared.state.lock().anchor
    }

    /// Store the latest ambient light estimate for the renderer
    pub fn update_light(&self, intensity: f32, color_correction: [f32; 4]) {
        if !intensity.is_finite() || color_correction.iter().any(|c| !c.is_finite()) {
            warn!("Ignoring non-finite light estimate");
            return;
        }
        self.shared.state.lock().light = LightEstimate {
            intensity,
            color_correction,
        };
    }

    /// Drop every splat. Anchor and camera are kept.
    pub fn clear(&self) {
        {
            let mut state = self.shared.state.lock();
            state.map.clear();
            state.epoch += 1;
            state.version += 1;
            state.generation += 1;
        }
        self.render_cache.lock().clear();
        self.sorter.request_sort();
        info!("Splat map cleared");
    }

    pub fn splat_count(&self) -> usize {
        self.shared.state.lock().map.len()
    }

    /// Copy of every splat record in insertion order
    pub fn records(&self) -> Vec<SplatRecord> {
        self.shared.state.lock().map.records().to_vec()
    }

    pub fn summary(&self) -> MapSummary {
        let state = self.shared.state.lock();
        MapSummary::from_records(state.map.records(), &state.anchor)
    }

    /// Write the map and anchor to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<MapSummary, MapFileError> {
        let path = path.as_ref();
        let (records, anchor) = {
            let state = self.shared.state.lock();
            (state.map.records().to_vec(), state.anchor)
        };

        write_map(path, &records, &anchor)?;
        let summary = MapSummary::from_records(&records, &anchor);
        info!("Saved {} splats to {}", summary.splat_count, path.display());
        Ok(summary)
    }

    /// Replace the map and anchor with the contents of `path`.
    ///
    /// The file is fully validated before anything is replaced; on error the
    /// current map is untouched.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<MapSummary, MapFileError> {
        let path = path.as_ref();
        let contents = read_map(path, self.config.map.max_splats).map_err(|err| {
            warn!("Failed to load map {}: {}", path.display(), err);
            err
        })?;

        let summary = contents.summary();
        let map = SplatMap::from_records(contents.records, self.config.map.voxel_size, self.config.map.max_splats);
        if map.index().len() < map.len() {
            debug!("{} loaded splats share a voxel and stay unindexed", map.len() - map.index().len());
        }

        {
            let mut state = self.shared.state.lock();
            state.map = map;
            state.anchor = contents.anchor;
            state.epoch += 1;
            state.version += 1;
            state.generation += 1;
        }
        self.render_cache.lock().clear();
        self.sorter.request_sort();

        info!("Loaded {} splats from {}", summary.splat_count, path.display());
        Ok(summary)
    }

    /// Wake the sorter. Returns `false` if a request was already pending.
    pub fn request_sort(&self) -> bool {
        self.sorter.request_sort()
    }

    /// Newest published sort order
    pub fn latest_sort(&self) -> Option<Arc<SortOrder>> {
        self.sorter.latest()
    }

    /// Run `f` with the current render frame. Returns `None` until a camera is set.
    ///
    /// The frame borrows engine buffers and is only valid inside `f`.
    pub fn render<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&RenderFrame<'_>) -> R,
    {
        let mut cache = self.render_cache.lock();
        let (records, view, projection, light, epoch, version) = {
            let state = self.shared.state.lock();
            let camera = state.camera?;
            // Only a flat copy of the records is made under the data lock
            let records = (!cache.is_current(state.epoch, state.version)).then(|| state.map.records().to_vec());
            (
                records,
                camera.view * state.anchor,
                camera.projection,
                state.light,
                state.epoch,
                state.version,
            )
        };

        if let Some(records) = records {
            cache.rebuild_instances(&records, epoch, version);
        }
        let order = self.sorter.latest();
        cache.prepare(order.as_ref(), self.config.render.min_opacity);

        let frame = RenderFrame {
            instances: cache.instances(),
            sorted_count: cache.sorted_count(),
            view,
            projection,
            camera_position: camera_position(&view),
            light,
            map_version: version,
            sort_version: cache.sort_version(),
        };
        Some(f(&frame))
    }

    pub fn is_sorter_running(&self) -> bool {
        self.sorter.is_running()
    }

    /// Stop the sorter thread. Fusion, persistence and rendering keep working
    /// with the last published order.
    pub fn shutdown(&mut self) {
        if self.sorter.is_running() {
            self.sorter.stop();
            info!("Splat engine shut down");
        }
    }
}

impl Drop for SplatEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`SplatEngine`]
pub struct SplatEngineBuilder {
    config: EngineConfig,
}

impl SplatEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn voxel_size(mut self, size: f32) -> Self {
        self.config.map.voxel_size = size;
        self
    }

    pub fn max_splats(mut self, max: usize) -> Self {
        self.config.map.max_splats = max;
        self
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.config.fusion.stride = stride;
        self
    }

    pub fn depth_range(mut self, min: f32, max: f32) -> Self {
        self.config.fusion.min_depth = min;
        self.config.fusion.max_depth = max;
        self
    }

    pub fn min_fusion_interval(mut self, interval: Duration) -> Self {
        self.config.fusion.min_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<SplatEngine, ConfigError> {
        SplatEngine::new(self.config)
    }
}

impl Default for SplatEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::frame::{ChannelOrder, ColorImage, DepthImage};
    use glam::Vec3;
    use tempfile::tempdir;

    fn engine() -> SplatEngine {
        SplatEngine::builder()
            .stride(1)
            .min_fusion_interval(Duration::ZERO)
            .build()
            .unwrap()
    }

    fn wall(depth: &[f32], size: usize) -> SensorFrame<'_> {
        SensorFrame::new(
            DepthImage::meters(depth, size, size),
            Mat4::IDENTITY,
            Projection::from_fov(1.0, 1.0),
        )
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        assert!(SplatEngine::builder().stride(0).build().is_err());
    }

    #[test]
    fn test_fusion_updates_count_and_version() {
        let engine = engine();
        let depth = vec![1.5f32; 32 * 32];
        let outcome = engine.process_depth_frame(&wall(&depth, 32));
        let stats = *outcome.stats().unwrap();

        assert!(stats.inserted > 0);
        assert_eq!(engine.splat_count(), stats.inserted);

        // Same frame again only reinforces
        let again = engine.process_depth_frame(&wall(&depth, 32));
        assert_eq!(again.stats().unwrap().inserted, 0);
        assert_eq!(engine.splat_count(), stats.inserted);
    }

    #[test]
    fn test_rate_limit() {
        let engine = SplatEngine::builder()
            .stride(4)
            .min_fusion_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let depth = vec![1.0f32; 16 * 16];

        assert!(engine.process_depth_frame(&wall(&depth, 16)).is_fused());
        assert_eq!(engine.process_depth_frame(&wall(&depth, 16)), FusionOutcome::RateLimited);
    }

    #[test]
    fn test_rejected_frame_leaves_map_untouched() {
        let engine = engine();
        let depth = vec![1.0f32; 10];
        let frame = SensorFrame::new(DepthImage::meters(&depth, 4, 4), Mat4::IDENTITY, Projection::default());
        assert!(matches!(engine.process_depth_frame(&frame), FusionOutcome::Rejected(_)));
        assert_eq!(engine.splat_count(), 0);
    }

    #[test]
    fn test_overflowing_frame_dimensions_rejected() {
        let engine = engine();
        let depth = [1.0f32; 4];
        let frame = SensorFrame::new(
            DepthImage::meters(&depth, usize::MAX / 2, 3),
            Mat4::IDENTITY,
            Projection::default(),
        );
        assert_eq!(
            engine.process_depth_frame(&frame),
            FusionOutcome::Rejected(FrameError::DimensionOverflow { width: usize::MAX / 2, height: 3 })
        );

        let color = [0u8; 12];
        let frame = SensorFrame::new(DepthImage::meters(&depth, 2, 2), Mat4::IDENTITY, Projection::default())
            .with_color(ColorImage::new(&color, usize::MAX / 4, 2, ChannelOrder::Rgb));
        assert!(matches!(
            engine.process_depth_frame(&frame),
            FusionOutcome::Rejected(FrameError::DimensionOverflow { .. })
        ));
        assert_eq!(engine.splat_count(), 0);
    }

    #[test]
    fn test_align_map_validation() {
        let engine = engine();
        assert_eq!(engine.align_map(Mat4::ZERO), Err(AnchorError::Singular));

        let mut nan = Mat4::IDENTITY;
        nan.x_axis.x = f32::NAN;
        assert_eq!(engine.align_map(nan), Err(AnchorError::NonFinite));

        let anchor = Mat4::from_translation(Vec3::new(0.5, 0.0, 0.0));
        engine.align_map(anchor).unwrap();
        assert_eq!(engine.anchor(), anchor);
    }

    #[test]
    fn test_render_requires_camera() {
        let engine = engine();
        assert!(engine.render(|frame| frame.instances.len()).is_none());

        engine.update_camera(Mat4::IDENTITY, Projection::default()).unwrap();
        assert_eq!(engine.render(|frame| frame.instances.len()), Some(0));
    }

    #[test]
    fn test_render_follows_fusion_without_holding_data_lock() {
        let engine = engine();
        engine.update_camera(Mat4::IDENTITY, Projection::default()).unwrap();
        assert_eq!(engine.render(|frame| frame.instances.len()), Some(0));

        let depth = vec![1.0f32; 16 * 16];
        engine.process_depth_frame(&wall(&depth, 16));
        let count = engine.splat_count();
        assert!(count > 0);

        // The closure takes the data lock itself
        let (rendered, counted) = engine
            .render(|frame| (frame.instances.len(), engine.splat_count()))
            .unwrap();
        assert_eq!(rendered, count);
        assert_eq!(counted, count);

        engine.clear();
        assert_eq!(engine.render(|frame| frame.instances.len()), Some(0));
    }

    #[test]
    fn test_light_forwarded_to_render() {
        let engine = engine();
        engine.update_camera(Mat4::IDENTITY, Projection::default()).unwrap();
        engine.update_light(0.6, [0.9, 1.0, 1.1, 0.5]);

        let light = engine.render(|frame| frame.light).unwrap();
        assert_eq!(light.intensity, 0.6);
        assert_eq!(light.color_correction, [0.9, 1.0, 1.1, 0.5]);
    }

    #[test]
    fn test_clear_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.splt");
        let engine = engine();
        let depth = vec![2.0f32; 24 * 24];
        engine.process_depth_frame(&wall(&depth, 24));
        let count = engine.splat_count();

        let saved = engine.save(&path).unwrap();
        assert_eq!(saved.splat_count, count);

        engine.clear();
        assert_eq!(engine.splat_count(), 0);

        let loaded = engine.load(&path).unwrap();
        assert_eq!(loaded.splat_count, count);
        assert_eq!(engine.splat_count(), count);
    }

    #[test]
    fn test_shutdown_joins_sorter() {
        let mut engine = engine();
        assert!(engine.is_sorter_running());
        engine.shutdown();
        assert!(!engine.is_sorter_running());
        // Still usable without the sorter
        let depth = vec![1.0f32; 8 * 8];
        assert!(engine.process_depth_frame(&wall(&depth, 8)).is_fused());
    }
}
