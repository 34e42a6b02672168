//! Depth fusion module
//!
//! Sensor frame inputs and the fusion pass that turns them into splats.

pub mod frame;
pub mod depth_fusion;

pub use frame::{ChannelOrder, ColorImage, DepthImage, DepthSamples, FrameError, SensorFrame};
pub use depth_fusion::{DepthFusion, FusionBatch, FusionOutcome, FusionStats, RateGate};
