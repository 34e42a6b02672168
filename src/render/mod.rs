//! Render hand-off module

pub mod bridge;

pub use bridge::{order_instances, LightEstimate, RenderCache, RenderFrame, SplatInstance};
