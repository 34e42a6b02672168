//! # splatmap
//!
//! Incremental point-splat mapping for AR overlays.
//!
//! ## Overview
//!
//! Depth frames from an AR session are unprojected into world space and fused
//! into a voxel-deduplicated map of point splats:
//! - at most one splat per voxel, found through a hash index
//! - confidence grows with repeated observations and doubles as opacity
//! - a background thread keeps a back-to-front order for the current camera
//! - maps are saved to and loaded from a compact binary file
//!
//! ## Example
//!
//! ```rust,no_run
//! use splatmap::{DepthImage, EngineConfig, Projection, SensorFrame, SplatEngine};
//! use glam::Mat4;
//!
//! let engine = SplatEngine::new(EngineConfig::default()).unwrap();
//! let projection = Projection::from_fov(1.0, 4.0 / 3.0);
//!
//! let depth = vec![1.2f32; 160 * 120];
//! let frame = SensorFrame::new(DepthImage::meters(&depth, 160, 120), Mat4::IDENTITY, projection);
//! engine.process_depth_frame(&frame);
//!
//! engine.update_camera(Mat4::IDENTITY, projection).unwrap();
//! engine.render(|frame| {
//!     let bytes = frame.as_bytes();
//!     println!("{} splats, {} bytes", frame.instances.len(), bytes.len());
//! });
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod fusion;
pub mod io;
pub mod pipeline;
pub mod render;
pub mod synthetic;

pub use config::{ConfigError, ConfigLoader, EngineConfig, FusionParams, MapParams, RenderParams, SorterParams};
pub use self::core::{Projection, SplatMap, SplatRecord, VoxelIndex, VoxelKey};
pub use fusion::{
    ChannelOrder, ColorImage, DepthImage, FrameError, FusionOutcome, FusionStats, SensorFrame,
};
pub use io::{MapFileError, MapSummary};
pub use pipeline::{AnchorError, BackgroundSorter, SortOrder, SplatEngine, SplatEngineBuilder};
pub use render::{LightEstimate, RenderFrame, SplatInstance};

// Re-export glam for convenience
pub use glam::{Mat4, Vec3};
